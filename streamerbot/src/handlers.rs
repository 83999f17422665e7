//! Lifecycle callbacks.
//!
//! ```rust,no_run
//! use streamerbot::{EventHandlers, StreamerbotClient};
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|info| println!("connected to {} {}", info.name, info.version))
//!     .on_disconnect(|| println!("disconnected"))
//!     .on_error(|err| eprintln!("{err}"));
//! let client = StreamerbotClient::builder().handlers(handlers).build();
//! ```

use crate::{dispatch::isolate, error::Error, message::InstanceInfo};

use serde_json::Value;
use std::{fmt, sync::Arc};

pub type OnConnectCallback = Arc<dyn Fn(&InstanceInfo) + Send + Sync>;
pub type OnDisconnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type OnErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
pub type OnDataCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callbacks for connection lifecycle events. All are optional.
///
/// Panics inside a callback are caught and logged.
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_connect: Option<OnConnectCallback>,
    on_disconnect: Option<OnDisconnectCallback>,
    on_error: Option<OnErrorCallback>,
    on_data: Option<OnDataCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_data", &self.on_data.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the session is ready, with the identity from the Hello.
    pub fn on_connect(mut self, f: impl Fn(&InstanceInfo) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Called when a ready session ends, explicitly or not.
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Single sink for connection, protocol and reconnect errors.
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called for every inbound message. Responses arrive with an
    /// `event: { source: "Request", type: <kind> }` envelope merged in.
    pub fn on_data(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub(crate) fn has_data_handler(&self) -> bool {
        self.on_data.is_some()
    }

    pub(crate) fn emit_connect(&self, info: &InstanceInfo) {
        if let Some(cb) = &self.on_connect {
            isolate("on_connect", || cb(info));
        }
    }

    pub(crate) fn emit_disconnect(&self) {
        if let Some(cb) = &self.on_disconnect {
            isolate("on_disconnect", &**cb);
        }
    }

    pub(crate) fn emit_error(&self, error: &Error) {
        if let Some(cb) = &self.on_error {
            isolate("on_error", || cb(error));
        }
    }

    pub(crate) fn emit_data(&self, data: &Value) {
        if let Some(cb) = &self.on_data {
            isolate("on_data", || cb(data));
        }
    }
}
