//! Waiting for a `Custom.Event` that answers an action invocation.
//!
//! The caller passes [`CustomEventWaiter::response_id`] to the action as
//! [`RESPONSE_ID_ARG`]. The action replies by raising a custom event whose
//! `eventName` is that id, and the event's `args` become the result.

use crate::{
    client::StreamerbotClient,
    correlator::{RESPONSE_ID_PREFIX, generate_id},
    dispatch::ListenerId,
    error::{Error, Result},
    message::Event,
    subscription::EventPattern,
};

use serde_json::Value;
use std::{
    future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::oneshot, time::sleep};
use tracing::{debug, warn};

/// Action argument carrying the response id.
pub const RESPONSE_ID_ARG: &str = "customEventResponseId";

pub const CUSTOM_EVENT_SOURCE: &str = "Custom";
pub const CUSTOM_EVENT_TYPE: &str = "Event";

/// A temporary `Custom.Event` listener. Removed again when dropped, whatever
/// the outcome.
#[derive(Debug)]
pub struct CustomEventWaiter {
    client: StreamerbotClient,
    response_id: String,
    listener: ListenerId,
    rx: oneshot::Receiver<Value>,
}

impl CustomEventWaiter {
    /// Registers the listener before anything is sent, so a fast reply
    /// can't be missed.
    pub async fn arm(client: &StreamerbotClient) -> Self {
        let response_id = generate_id(RESPONSE_ID_PREFIX);
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let expected = response_id.clone();
        let callback = move |event: &Event| {
            if event.data.get("eventName").and_then(Value::as_str) != Some(expected.as_str()) {
                return;
            }
            let sender = tx.lock().ok().and_then(|mut tx| tx.take());
            if let Some(sender) = sender {
                let args = event.data.get("args").cloned().unwrap_or(Value::Null);
                let _ = sender.send(args);
            }
        };
        let pattern = EventPattern::exact(CUSTOM_EVENT_SOURCE, CUSTOM_EVENT_TYPE);
        let (listener, resubscribe) = client.add_listener(vec![pattern], Arc::new(callback), false);
        if let Some(set) = resubscribe {
            if let Err(err) = client.send_subscriptions(&set).await {
                warn!(error = %err, "could not subscribe to custom events");
            }
        }
        debug!(%response_id, %listener, "waiting for custom event response");
        CustomEventWaiter {
            client: client.clone(),
            response_id,
            listener,
            rx,
        }
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    /// Resolves with the matching event's `args`.
    pub async fn wait(mut self, wait: Duration) -> Result<Value> {
        let connection = self.client.connection_token();
        let disconnected = async {
            match &connection {
                Some(token) => token.cancelled().await,
                None => future::pending().await,
            }
        };
        tokio::select! {
            args = &mut self.rx => args.map_err(|_| Error::ConnectionClosed("a custom event")),
            _ = sleep(wait) => Err(Error::CustomEventTimeout(wait)),
            _ = disconnected => Err(Error::ConnectionClosed("a custom event")),
        }
    }
}

impl Drop for CustomEventWaiter {
    fn drop(&mut self) {
        self.client.off(self.listener);
    }
}
