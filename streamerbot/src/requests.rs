//! Thin wrappers around [`StreamerbotClient::request`].

use crate::{
    bridge::{CustomEventWaiter, RESPONSE_ID_ARG},
    catalog::EventCatalog,
    client::StreamerbotClient,
    error::Result,
    message::{InstanceInfo, Request, Response, kind},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, time::Duration};

/// Identifies an action by id, by name, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ActionRef {
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: None,
        }
    }
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
        }
    }
}

/// A bare string is taken as an action id.
impl From<&str> for ActionRef {
    fn from(value: &str) -> Self {
        ActionRef::id(value)
    }
}

impl From<String> for ActionRef {
    fn from(value: String) -> Self {
        ActionRef::id(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    YouTube,
    Trovo,
    Kick,
}

impl Platform {
    /// Prefix of the platform specific request kinds, e.g. `TwitchGetUserGlobal`.
    fn request_prefix(self) -> &'static str {
        match self {
            Platform::Twitch => "Twitch",
            Platform::YouTube => "YouTube",
            Platform::Trovo => "Trovo",
            Platform::Kick => "Kick",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Twitch => "twitch",
            Platform::YouTube => "youtube",
            Platform::Trovo => "trovo",
            Platform::Kick => "kick",
        })
    }
}

impl std::str::FromStr for Platform {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "twitch" => Ok(Platform::Twitch),
            "youtube" => Ok(Platform::YouTube),
            "trovo" => Ok(Platform::Trovo),
            "kick" => Ok(Platform::Kick),
            _ => Err(format!("unknown platform {s:?}")),
        }
    }
}

fn do_action_request(action: ActionRef, args: Option<Map<String, Value>>) -> Result<Request> {
    Ok(Request::new(kind::DO_ACTION)
        .param("action", serde_json::to_value(action)?)
        .param_opt("args", args.map(Value::Object)))
}

fn user_global_request(
    platform: Platform,
    plural: bool,
    user_id: Option<&str>,
    variable: Option<&str>,
    persisted: bool,
) -> Request {
    let suffix = if plural {
        "GetUserGlobals"
    } else {
        "GetUserGlobal"
    };
    Request::new(format!("{}{suffix}", platform.request_prefix()))
        .param_opt("userId", user_id)
        .param_opt("variable", variable)
        .param("persisted", persisted)
}

impl StreamerbotClient {
    pub async fn get_info(&self) -> Result<InstanceInfo> {
        let response = self.request(Request::new(kind::GET_INFO)).await?;
        Ok(response.field("info")?)
    }

    pub async fn get_events(&self) -> Result<EventCatalog> {
        let response = self.request(Request::new(kind::GET_EVENTS)).await?;
        Ok(EventCatalog::from_response(&response)?)
    }

    pub async fn get_actions(&self) -> Result<Response> {
        self.request(Request::new(kind::GET_ACTIONS)).await
    }

    pub async fn do_action(
        &self,
        action: impl Into<ActionRef>,
        args: Option<Map<String, Value>>,
    ) -> Result<Response> {
        self.request(do_action_request(action.into(), args)?).await
    }

    /// Runs an action and waits for it to answer through a custom event.
    ///
    /// The response id is added to `args` under `customEventResponseId`.
    /// `wait` defaults to the configured custom event timeout.
    pub async fn do_action_with_response(
        &self,
        action: impl Into<ActionRef>,
        args: Option<Map<String, Value>>,
        wait: Option<Duration>,
    ) -> Result<Value> {
        let waiter = CustomEventWaiter::arm(self).await;
        let mut args = args.unwrap_or_default();
        args.insert(RESPONSE_ID_ARG.into(), waiter.response_id().into());
        self.do_action(action, Some(args)).await?;
        waiter
            .wait(wait.unwrap_or(self.options().timeouts.custom_event))
            .await
    }

    pub async fn get_broadcaster(&self) -> Result<Response> {
        self.request(Request::new(kind::GET_BROADCASTER)).await
    }

    pub async fn get_active_viewers(&self) -> Result<Response> {
        self.request(Request::new(kind::GET_ACTIVE_VIEWERS)).await
    }

    pub async fn get_credits(&self) -> Result<Response> {
        self.request(Request::new(kind::GET_CREDITS)).await
    }

    /// Fills the credits with fake data.
    pub async fn test_credits(&self) -> Result<Response> {
        self.request(Request::new(kind::TEST_CREDITS)).await
    }

    pub async fn clear_credits(&self) -> Result<Response> {
        self.request(Request::new(kind::CLEAR_CREDITS)).await
    }

    pub async fn get_code_triggers(&self) -> Result<Response> {
        self.request(Request::new(kind::GET_CODE_TRIGGERS)).await
    }

    pub async fn execute_code_trigger(
        &self,
        trigger_name: &str,
        args: Option<Map<String, Value>>,
    ) -> Result<Response> {
        let request = Request::new(kind::EXECUTE_CODE_TRIGGER)
            .param("triggerName", trigger_name)
            .param_opt("args", args.map(Value::Object));
        self.request(request).await
    }

    pub async fn get_commands(&self) -> Result<Response> {
        self.request(Request::new(kind::GET_COMMANDS)).await
    }

    pub async fn get_global(&self, variable: &str, persisted: bool) -> Result<Response> {
        let request = Request::new(kind::GET_GLOBAL)
            .param("variable", variable)
            .param("persisted", persisted);
        self.request(request).await
    }

    pub async fn get_globals(&self, persisted: bool) -> Result<Response> {
        let request = Request::new(kind::GET_GLOBALS).param("persisted", persisted);
        self.request(request).await
    }

    /// One user's value of `variable`, or every user's if `user_id` is `None`.
    pub async fn get_user_global(
        &self,
        platform: Platform,
        user_id: Option<&str>,
        variable: &str,
        persisted: bool,
    ) -> Result<Response> {
        let request = user_global_request(platform, false, user_id, Some(variable), persisted);
        self.request(request).await
    }

    pub async fn get_user_globals(
        &self,
        platform: Platform,
        variable: Option<&str>,
        persisted: bool,
    ) -> Result<Response> {
        let request = user_global_request(platform, true, None, variable, persisted);
        self.request(request).await
    }

    pub async fn send_message(
        &self,
        platform: Platform,
        message: &str,
        bot: bool,
        internal: bool,
    ) -> Result<Response> {
        let request = Request::new(kind::SEND_MESSAGE)
            .param("platform", platform.to_string())
            .param("message", message)
            .param("bot", bot)
            .param("internal", internal);
        self.request(request).await
    }

    pub async fn get_user_pronouns(
        &self,
        platform: Platform,
        user_login: &str,
    ) -> Result<Response> {
        let request = Request::new(kind::GET_USER_PRONOUNS)
            .param("platform", platform.to_string())
            .param("userLogin", user_login);
        self.request(request).await
    }

    /// Only Twitch and YouTube expose emotes.
    pub async fn get_emotes(&self, platform: Platform) -> Result<Response> {
        self.request(Request::new(format!("{}GetEmotes", platform.request_prefix())))
            .await
    }

    pub async fn get_monitored_youtube_broadcasts(&self) -> Result<Response> {
        self.request(Request::new(kind::GET_MONITORED_YOUTUBE_BROADCASTS))
            .await
    }
}
