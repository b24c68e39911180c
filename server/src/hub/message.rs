use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single broadcast unit. Lives only for the duration of one fan-out.
///
/// This is also the wire shape of every server→client data frame and of the
/// trigger endpoint's request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(
        channel: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            payload,
        }
    }
}

/// Identity of one network link, assigned by the Hub on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The (connection, channel) membership relation carried by register and
/// unregister events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub conn_id: ConnectionId,
    pub channel: String,
}

impl Subscription {
    pub fn new(conn_id: ConnectionId, channel: impl Into<String>) -> Self {
        Self {
            conn_id,
            channel: channel.into(),
        }
    }
}
