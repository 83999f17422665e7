#![allow(dead_code)]

use serde_json::{Value, json};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use streamerbot::{
    ClientOptions, EventHandlers, ReconnectOptions, StreamerbotClient, Timeouts,
    auth::authentication_secret,
    transport::memory::{self, MemoryPeer, MemoryTransport},
};
use tokio::{sync::mpsc, time::sleep};

pub const SALT: &str = "c2FsdHlzYWx0";
pub const CHALLENGE: &str = "Y2hhbGxlbmdlLTEyMw==";

pub fn catalog() -> Value {
    json!({
        "Custom": ["Event"],
        "General": ["Custom"],
        "Twitch": ["Cheer", "Follow", "Raid"],
    })
}

pub fn instance_info() -> Value {
    json!({
        "instanceId": "5b2d3f4a-test",
        "name": "Streamer.bot",
        "os": "windows",
        "version": "0.2.5",
    })
}

pub fn hello(authentication: bool) -> Value {
    let mut hello = json!({
        "request": "Hello",
        "info": instance_info(),
        "timestamp": "2024-05-01T12:00:00.0000000+00:00",
        "session": "c1d6f0b2",
    });
    if authentication {
        hello["authentication"] = json!({ "challenge": CHALLENGE, "salt": SALT });
    }
    hello
}

/// Fast timeouts so failure paths don't slow the suite down.
pub fn options() -> ClientOptions {
    ClientOptions {
        immediate: false,
        timeouts: Timeouts {
            connect: Duration::from_secs(1),
            handshake: Duration::from_secs(1),
            request: Duration::from_millis(500),
            disconnect: Duration::from_millis(500),
            custom_event: Duration::from_millis(150),
        },
        reconnect: ReconnectOptions {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
        },
        ..Default::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    /// Challenge clients and expect this password.
    pub password: Option<String>,
    /// Request kinds that never get a response.
    pub ignore: Vec<&'static str>,
    /// Request kinds answered with an error status.
    pub fail: Vec<&'static str>,
    /// Answer `DoAction` requests carrying a response id with a custom event.
    pub answer_custom_events: bool,
}

enum Control {
    Send(Value),
    Close(u16),
}

/// A scripted Streamer.bot serving one connection at a time over the
/// in-memory transport.
pub struct MockServer {
    pub transport: MemoryTransport,
    requests: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicUsize>,
    control: mpsc::UnboundedSender<Control>,
}

impl MockServer {
    pub fn start(behaviour: Behaviour) -> Self {
        let (transport, mut listener) = memory::pair();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let (log, closed_count) = (requests.clone(), closed.clone());
        tokio::spawn(async move {
            while let Some(peer) = listener.accept().await {
                serve(peer, &behaviour, &log, &mut control_rx).await;
                closed_count.fetch_add(1, Ordering::SeqCst);
            }
        });
        MockServer {
            transport,
            requests,
            closed,
            control,
        }
    }

    pub fn client(&self, options: ClientOptions, handlers: EventHandlers) -> StreamerbotClient {
        StreamerbotClient::builder()
            .options(options)
            .handlers(handlers)
            .transport(self.transport.clone())
            .build()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_of(&self, kind: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|request| request["request"] == kind)
            .collect()
    }

    pub fn send_event(&self, source: &str, kind: &str, data: Value) {
        let event = json!({
            "timeStamp": "2024-05-01T12:00:01.0000000+00:00",
            "event": { "source": source, "type": kind },
            "data": data,
        });
        self.control.send(Control::Send(event)).unwrap();
    }

    /// Closes the current connection with `code`.
    pub fn close(&self, code: u16) {
        self.control.send(Control::Close(code)).unwrap();
    }

    /// Connections that have ended, from either side.
    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut peer: MemoryPeer,
    behaviour: &Behaviour,
    log: &Mutex<Vec<Value>>,
    control: &mut mpsc::UnboundedReceiver<Control>,
) {
    peer.send_json(&hello(behaviour.password.is_some()));
    let mut authenticated = behaviour.password.is_none();
    loop {
        tokio::select! {
            request = peer.recv_json() => {
                let Some(request) = request else { return };
                log.lock().unwrap().push(request.clone());
                for reply in respond(&request, behaviour, &mut authenticated) {
                    peer.send_json(&reply);
                }
            }
            Some(control) = control.recv() => match control {
                Control::Send(message) => {
                    peer.send_json(&message);
                }
                Control::Close(code) => {
                    peer.close(code, "");
                    return;
                }
            },
        }
    }
}

pub fn reply(id: &Value, status: &str, extra: Value) -> Value {
    let mut reply = json!({ "id": id, "status": status });
    if let (Some(fields), Value::Object(extra)) = (reply.as_object_mut(), extra) {
        fields.extend(extra);
    }
    reply
}

fn respond(request: &Value, behaviour: &Behaviour, authenticated: &mut bool) -> Vec<Value> {
    let id = &request["id"];
    let kind = request["request"].as_str().unwrap_or_default();
    if behaviour.ignore.contains(&kind) {
        return vec![];
    }
    if kind == "Authenticate" {
        let password = behaviour.password.as_deref().unwrap_or_default();
        let expected = authentication_secret(password, SALT, CHALLENGE);
        if request["authentication"] == expected.as_str() {
            *authenticated = true;
            return vec![reply(id, "ok", json!({}))];
        }
        return vec![reply(id, "error", json!({ "error": "Authentication failed" }))];
    }
    if !*authenticated {
        return vec![reply(id, "error", json!({ "error": "Authentication required" }))];
    }
    if behaviour.fail.contains(&kind) {
        return vec![reply(id, "error", json!({ "error": "Request failed" }))];
    }
    match kind {
        "GetEvents" => vec![reply(id, "ok", json!({ "events": catalog() }))],
        "GetInfo" => vec![reply(id, "ok", json!({ "info": instance_info() }))],
        "Subscribe" | "UnSubscribe" => {
            vec![reply(id, "ok", json!({ "events": request["events"] }))]
        }
        "DoAction" => {
            let mut replies = vec![reply(id, "ok", json!({}))];
            let response_id = request["args"]["customEventResponseId"].as_str();
            if let (true, Some(response_id)) = (behaviour.answer_custom_events, response_id) {
                replies.push(json!({
                    "timeStamp": "2024-05-01T12:00:02.0000000+00:00",
                    "event": { "source": "Custom", "type": "Event" },
                    "data": { "eventName": response_id, "args": { "answer": 42 } },
                }));
            }
            replies
        }
        _ => vec![reply(id, "ok", json!({}))],
    }
}

/// Plays the server side of a handshake without authentication.
pub async fn handshake(peer: &mut MemoryPeer) {
    peer.send_json(&hello(false));
    let request = peer.recv_json().await.unwrap();
    assert_eq!(request["request"], "GetEvents");
    peer.send_json(&reply(&request["id"], "ok", json!({ "events": catalog() })));
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

/// Records the `Debug` form of every error passed to `on_error`.
pub fn error_log() -> (EventHandlers, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let log = errors.clone();
    let handlers = EventHandlers::new().on_error(move |err| {
        log.lock().unwrap().push(format!("{err:?}"));
    });
    (handlers, errors)
}
