//! Fan-out of inbound events to registered listeners.

use crate::{message::Event, subscription::EventPattern};

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::error;

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `on`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

struct Listener {
    id: ListenerId,
    patterns: Vec<EventPattern>,
    callback: Callback,
}

/// Registered listeners, in registration order.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

impl Listeners {
    pub fn add(&mut self, patterns: Vec<EventPattern>, callback: Callback) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push(Listener {
            id,
            patterns,
            callback,
        });
        id
    }
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|listener| listener.id != id);
        self.entries.len() != before
    }
    pub fn clear(&mut self) {
        self.entries.clear();
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Every pattern of every listener, for folding into the subscription set.
    pub fn patterns(&self) -> impl Iterator<Item = &EventPattern> {
        self.entries.iter().flat_map(|listener| &listener.patterns)
    }
    /// Callbacks whose patterns match `event`, each at most once.
    ///
    /// The result is a snapshot so it can be invoked without holding the lock
    /// guarding `self`. Listeners added by a callback see the next event.
    pub fn matching(&self, event: &Event) -> Vec<Callback> {
        self.entries
            .iter()
            .filter(|listener| listener.patterns.iter().any(|p| p.matches(&event.event)))
            .map(|listener| listener.callback.clone())
            .collect()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|l| (l.id, &l.patterns)))
            .finish()
    }
}

/// Runs every callback, containing panics so one bad listener can't take the
/// read loop down with it.
pub fn dispatch(callbacks: &[Callback], event: &Event) {
    for callback in callbacks {
        isolate("event listener", || callback(event));
    }
}

/// Runs a user callback and logs instead of unwinding if it panics.
pub(crate) fn isolate(what: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(
            callback = what,
            panic = panic_message(&*panic),
            "callback panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
