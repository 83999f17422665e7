//! Matching responses to the requests that caused them.

use crate::{
    error::{Error, Result},
    message::Response,
};

use rand::Rng;
use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::oneshot;

/// Id prefix for client requests.
pub const REQUEST_ID_PREFIX: &str = "req";
/// Id prefix for custom-event response correlation.
pub const RESPONSE_ID_PREFIX: &str = "res";

/// `sb:client:<prefix>:<unix millis>-<random>`
pub fn generate_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let salt: u32 = rand::thread_rng().r#gen();
    format!("sb:client:{prefix}:{millis}-{salt}")
}

#[derive(Debug)]
struct Pending {
    kind: String,
    tx: oneshot::Sender<Response>,
}

/// Requests sent on the current socket that have not been answered yet.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<String, Pending>,
}

impl PendingRequests {
    /// Returns a fresh id that is not in flight.
    pub fn unused_id(&self) -> String {
        loop {
            let id = generate_id(REQUEST_ID_PREFIX);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
    pub fn insert(&mut self, id: String, kind: String) -> Result<oneshot::Receiver<Response>> {
        if self.entries.contains_key(&id) {
            return Err(Error::DuplicateRequestId(id));
        }
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, Pending { kind, tx });
        Ok(rx)
    }
    /// Removes the entry for `id`, handing back the request kind and the
    /// sender to resolve it with.
    pub fn take(&mut self, id: &str) -> Option<(String, oneshot::Sender<Response>)> {
        self.entries
            .remove(id)
            .map(|pending| (pending.kind, pending.tx))
    }
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }
    /// Drops every entry. Waiters observe a closed channel.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
