use std::collections::{HashMap, HashSet};

use super::message::ConnectionId;

/// Channel name → subscribed connections, plus the reverse index of each
/// connection's own channels.
///
/// Owned and mutated only by the Hub's event loop, so it carries no locks.
/// A channel entry exists if and only if at least one connection lists that
/// channel in its own set; empty entries are dropped immediately.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn_id` to `channel`, creating the entry if absent.
    ///
    /// Returns false when the subscription already existed.
    pub fn subscribe(&mut self, conn_id: ConnectionId, channel: &str) -> bool {
        let added = self
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id);
        self.memberships
            .entry(conn_id)
            .or_default()
            .insert(channel.to_string());
        added
    }

    /// Remove `conn_id` from `channel`. No-op if it was not subscribed.
    ///
    /// Returns true when a subscription was actually removed.
    pub fn unsubscribe(&mut self, conn_id: ConnectionId, channel: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(members) => {
                let removed = members.remove(&conn_id);
                if members.is_empty() {
                    self.channels.remove(channel);
                }
                removed
            }
            None => false,
        };

        if let Some(own) = self.memberships.get_mut(&conn_id) {
            own.remove(channel);
            if own.is_empty() {
                self.memberships.remove(&conn_id);
            }
        }

        removed
    }

    /// Unsubscribe `conn_id` from every channel it belongs to.
    ///
    /// Returns the channels it left, one entry per channel.
    pub fn remove_connection(&mut self, conn_id: ConnectionId) -> Vec<String> {
        let channels: Vec<String> = self
            .memberships
            .get(&conn_id)
            .map(|own| own.iter().cloned().collect())
            .unwrap_or_default();

        for channel in &channels {
            self.unsubscribe(conn_id, channel);
        }

        channels
    }

    pub fn members(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, conn_id: ConnectionId) -> HashSet<String> {
        self.memberships.get(&conn_id).cloned().unwrap_or_default()
    }

    pub fn contains_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.channels.values().map(HashSet::len).sum()
    }
}
