//! Wire types for the Streamer.bot WebSocket protocol.
//!
//! Every frame is a JSON text message. Outbound requests look like
//! `{ "request": <kind>, "id": <id>, ...params }`, responses echo the id
//! together with a `status`, and broadcast events carry an
//! `{ "event": { "source", "type" }, "data" }` envelope instead of an id.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tungstenite::Message as WsMessage;

/// `status` value of a successful response.
pub const STATUS_OK: &str = "ok";

/// Event source used for the synthetic envelope attached to responses.
pub const REQUEST_EVENT_SOURCE: &str = "Request";

/// Request kinds understood by Streamer.bot.
pub mod kind {
    pub const HELLO: &str = "Hello";
    pub const AUTHENTICATE: &str = "Authenticate";
    pub const SUBSCRIBE: &str = "Subscribe";
    pub const UNSUBSCRIBE: &str = "UnSubscribe";
    pub const GET_EVENTS: &str = "GetEvents";
    pub const GET_INFO: &str = "GetInfo";
    pub const GET_ACTIONS: &str = "GetActions";
    pub const DO_ACTION: &str = "DoAction";
    pub const GET_BROADCASTER: &str = "GetBroadcaster";
    pub const GET_ACTIVE_VIEWERS: &str = "GetActiveViewers";
    pub const GET_CREDITS: &str = "GetCredits";
    pub const TEST_CREDITS: &str = "TestCredits";
    pub const CLEAR_CREDITS: &str = "ClearCredits";
    pub const GET_CODE_TRIGGERS: &str = "GetCodeTriggers";
    pub const EXECUTE_CODE_TRIGGER: &str = "ExecuteCodeTrigger";
    pub const GET_COMMANDS: &str = "GetCommands";
    pub const GET_GLOBAL: &str = "GetGlobal";
    pub const GET_GLOBALS: &str = "GetGlobals";
    pub const SEND_MESSAGE: &str = "SendMessage";
    pub const GET_USER_PRONOUNS: &str = "GetUserPronouns";
    pub const GET_MONITORED_YOUTUBE_BROADCASTS: &str = "GetMonitoredYouTubeBroadcasts";
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Not a text message")]
    NotText,
    #[error("JSON deserialize failed ({0})")]
    Json(#[from] serde_json::Error),
}

/// An outbound request descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Request {
    #[serde(rename = "request")]
    pub kind: String,
    /// Correlation id. Generated by the client when left empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            params: Map::new(),
        }
    }
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
    /// Like [`Request::param`] but skips `None`.
    pub fn param_opt<T: Into<Value>>(self, key: impl Into<String>, value: Option<T>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }
}

/// `{ source, type }` tag carried by broadcast events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct EventEnvelope {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl EventEnvelope {
    pub fn new(source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: kind.into(),
        }
    }
    /// The envelope attached to a response so it looks like any other event.
    pub fn request(kind: impl Into<String>) -> Self {
        Self::new(REQUEST_EVENT_SOURCE, kind)
    }
}

impl std::fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.source, self.kind)
    }
}

/// A response to a [`Request`], matched by id.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventEnvelope>,
    pub id: String,
    pub status: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
    /// The server supplied error message, if any.
    pub fn error(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
    /// Deserializes a single payload field.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T, serde_json::Error> {
        T::deserialize(self.payload.get(key).unwrap_or(&Value::Null))
    }
    /// Deserializes the whole payload.
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload))
    }
}

/// A broadcast event. The payload is left opaque.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub event: EventEnvelope,
    #[serde(default)]
    pub data: Value,
    #[serde(
        default,
        rename = "timeStamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_stamp: Option<String>,
}

/// Identity of the connected Streamer.bot instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub name: String,
    pub os: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

pub mod hello {
    use super::*;
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
    pub struct Authentication {
        pub challenge: String,
        pub salt: String,
    }
}

/// First message sent by the server after the socket opens.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Hello {
    pub info: InstanceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<hello::Authentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Any inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Hello(Hello),
    Response(Response),
    Event(Event),
    Other(Value),
}

impl ServerMessage {
    pub fn from_json_str(json: &str) -> Result<ServerMessage, DecodeError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }
    pub fn from_value(value: &Value) -> Result<ServerMessage, DecodeError> {
        let is_str = |key: &str| value.get(key).is_some_and(Value::is_string);
        if value.get("request").and_then(Value::as_str) == Some(kind::HELLO) {
            return Ok(ServerMessage::Hello(Hello::deserialize(value)?));
        }
        if is_str("id") && is_str("status") {
            return Ok(ServerMessage::Response(Response::deserialize(value)?));
        }
        let has_envelope = value
            .get("event")
            .is_some_and(|event| event.get("source").is_some() && event.get("type").is_some());
        if has_envelope {
            return Ok(ServerMessage::Event(Event::deserialize(value)?));
        }
        Ok(ServerMessage::Other(value.clone()))
    }
}

pub trait WsMessageExt {
    fn json_value(&self) -> Result<Value, DecodeError>;
    fn server_message(&self) -> Result<ServerMessage, DecodeError>;
}
impl WsMessageExt for WsMessage {
    fn json_value(&self) -> Result<Value, DecodeError> {
        match self {
            WsMessage::Text(text) => Ok(serde_json::from_str(text.as_str())?),
            _ => Err(DecodeError::NotText),
        }
    }
    fn server_message(&self) -> Result<ServerMessage, DecodeError> {
        ServerMessage::from_value(&self.json_value()?)
    }
}

pub trait IntoWsMessageJson {
    fn to_ws_message_json(&self) -> Result<WsMessage, serde_json::Error>;
}
impl<T: Serialize> IntoWsMessageJson for T {
    fn to_ws_message_json(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_params_are_flattened() {
        let request = Request::new(kind::DO_ACTION)
            .with_id("abc")
            .param("action", json!({ "name": "Test" }))
            .param_opt::<bool>("args", None);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "request": "DoAction", "id": "abc", "action": { "name": "Test" } })
        );
    }

    #[test]
    fn classifies_hello() {
        let msg = ServerMessage::from_json_str(
            r#"{"request":"Hello","info":{"instanceId":"i","name":"Streamer.bot","os":"windows","version":"0.2.5"},
                "authentication":{"challenge":"c","salt":"s"},"timestamp":"t","session":"x"}"#,
        )
        .unwrap();
        let ServerMessage::Hello(hello) = msg else {
            panic!("expected hello, got {msg:?}");
        };
        assert_eq!(hello.info.version, "0.2.5");
        assert_eq!(hello.authentication.unwrap().salt, "s");
    }

    #[test]
    fn hello_without_info_is_an_error() {
        assert!(ServerMessage::from_json_str(r#"{"request":"Hello"}"#).is_err());
    }

    #[test]
    fn classifies_response_and_keeps_payload() {
        let msg = ServerMessage::from_json_str(
            r#"{"id":"r1","status":"error","error":"Unknown request"}"#,
        )
        .unwrap();
        let ServerMessage::Response(response) = msg else {
            panic!("expected response");
        };
        assert!(!response.is_ok());
        assert_eq!(response.error(), Some("Unknown request"));
        assert!(response.event.is_none());
    }

    #[test]
    fn classifies_event() {
        let msg = ServerMessage::from_json_str(
            r#"{"timeStamp":"2024-01-01","event":{"source":"Twitch","type":"Follow"},"data":{"user_name":"x"}}"#,
        )
        .unwrap();
        let ServerMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert_eq!(event.event, EventEnvelope::new("Twitch", "Follow"));
        assert_eq!(event.data["user_name"], "x");
        assert_eq!(event.time_stamp.as_deref(), Some("2024-01-01"));
    }

    #[test]
    fn unknown_shapes_are_other() {
        let msg = ServerMessage::from_json_str(r#"{"hello":"world"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Other(_)));
        assert!(ServerMessage::from_json_str("not json").is_err());
    }

    #[test]
    fn binary_frames_are_rejected() {
        let msg = WsMessage::binary(vec![1, 2, 3]);
        assert!(matches!(msg.server_message(), Err(DecodeError::NotText)));
    }
}
