use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback invoked with an event's payload.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`Channel::bind`], used to remove that one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Local fan-out table for one subscribed channel: event name to the set of
/// callbacks bound to it. Nothing here touches the network.
pub struct Channel {
    name: String,
    handlers: DashMap<String, HashMap<HandlerId, Callback>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("events", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind<F>(&self, event: impl Into<String>, callback: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(event.into())
            .or_default()
            .insert(id, Arc::new(callback));
        id
    }

    /// Remove one callback. Returns whether it was bound.
    pub fn unbind(&self, event: &str, id: HandlerId) -> bool {
        let removed = match self.handlers.get_mut(event) {
            Some(mut callbacks) => callbacks.remove(&id).is_some(),
            None => false,
        };
        self.handlers.remove_if(event, |_, callbacks| callbacks.is_empty());
        removed
    }

    /// Remove every callback bound to `event`.
    pub fn unbind_all(&self, event: &str) {
        self.handlers.remove(event);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, |callbacks| callbacks.len())
    }

    /// Invoke every callback bound to `event` once, in no particular order.
    /// Returns how many ran.
    ///
    /// Callbacks run on a snapshot of the table, so they may bind or unbind
    /// freely; such changes apply from the next trigger on.
    pub fn trigger(&self, event: &str, data: &Value) -> usize {
        let snapshot: Vec<Callback> = match self.handlers.get(event) {
            Some(callbacks) => callbacks.values().cloned().collect(),
            None => return 0,
        };

        for callback in &snapshot {
            callback(data);
        }
        snapshot.len()
    }
}
