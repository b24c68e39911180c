//! The Hub: single sequential coordinator for channel membership and fan-out.
//!
//! One spawned task owns the [`ChannelRegistry`] and every connection's
//! outbound queue sender. Everything else talks to it through a cloneable
//! [`HubHandle`], which only ever pushes events onto the Hub's queues:
//!
//! - register / unregister / broadcast: the three data queues, selected with
//!   no priority between them. Membership changes are acknowledged once
//!   applied, so one connection's subscribes and unsubscribes take effect in
//!   the order it issued them even though they travel on separate queues.
//! - commands: connect, remove, introspection and shutdown drain
//!
//! Because the loop handles exactly one event per iteration, the registry is
//! never touched concurrently and needs no lock.

pub mod message;
pub mod registry;

pub use message::{ConnectionId, Message, Subscription};
pub use registry::ChannelRegistry;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::HubError;

/// Per-connection outbound queue capacity. A subscriber with this many
/// undrained messages is ejected on the next broadcast to it.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of each of the Hub's inbound event queues.
pub const HUB_QUEUE_CAPACITY: usize = 100;

/// Receiving end of a connection's outbound queue. Yields `None` once the Hub
/// has removed the connection.
pub type OutboundReceiver = mpsc::Receiver<Message>;

/// Control events sent to the Hub alongside the three data queues.
#[derive(Debug)]
pub enum HubCommand {
    /// Track a freshly upgraded link and hand back its outbound queue.
    Connect {
        addr: Option<SocketAddr>,
        reply: oneshot::Sender<(ConnectionId, OutboundReceiver)>,
    },
    /// Unregister from every channel and close the outbound queue.
    Remove(ConnectionId),
    /// Query the current members of a channel.
    Members {
        channel: String,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    /// Query the channels a connection belongs to.
    Subscriptions {
        conn_id: ConnectionId,
        reply: oneshot::Sender<HashSet<String>>,
    },
    /// Query aggregate counters.
    Stats(oneshot::Sender<HubStats>),
    /// Force-remove every live connection. Replies with how many were closed.
    CloseAll(oneshot::Sender<usize>),
}

/// A register or unregister event plus its acknowledgement.
#[derive(Debug)]
pub struct MembershipChange {
    pub sub: Subscription,
    applied: oneshot::Sender<()>,
}

/// Snapshot of the Hub's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub channels: usize,
    pub subscriptions: usize,
}

/// Cloneable entry point into the Hub's event queues.
#[derive(Debug, Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<MembershipChange>,
    unregister_tx: mpsc::Sender<MembershipChange>,
    broadcast_tx: mpsc::Sender<Message>,
    command_tx: mpsc::Sender<HubCommand>,
    live_rx: watch::Receiver<usize>,
}

impl HubHandle {
    /// Track a new connection. The returned receiver is the only consumer of
    /// its outbound queue; the Hub keeps the only sender.
    pub async fn connect(
        &self,
        addr: Option<SocketAddr>,
    ) -> Result<(ConnectionId, OutboundReceiver), HubError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(HubCommand::Connect { addr, reply })
            .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Subscribe `conn_id` to `channel`. Resolves once the Hub has applied it.
    pub async fn register(
        &self,
        conn_id: ConnectionId,
        channel: impl Into<String>,
    ) -> Result<(), HubError> {
        Self::change(&self.register_tx, Subscription::new(conn_id, channel)).await
    }

    /// Unsubscribe `conn_id` from `channel`. Resolves once the Hub has
    /// applied it.
    pub async fn unregister(
        &self,
        conn_id: ConnectionId,
        channel: impl Into<String>,
    ) -> Result<(), HubError> {
        Self::change(&self.unregister_tx, Subscription::new(conn_id, channel)).await
    }

    async fn change(
        queue: &mpsc::Sender<MembershipChange>,
        sub: Subscription,
    ) -> Result<(), HubError> {
        let (applied, rx) = oneshot::channel();
        queue.send(MembershipChange { sub, applied }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Queue a message for fan-out. Resolves once the Hub has accepted it,
    /// not once subscribers have received it.
    pub async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.broadcast_tx.send(message).await?;
        Ok(())
    }

    /// Remove a connection from every channel and close its outbound queue.
    /// Removing an unknown or already removed connection is a no-op.
    pub async fn remove_connection(&self, conn_id: ConnectionId) -> Result<(), HubError> {
        self.command_tx.send(HubCommand::Remove(conn_id)).await?;
        Ok(())
    }

    pub async fn members(&self, channel: impl Into<String>) -> Result<Vec<ConnectionId>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(HubCommand::Members {
                channel: channel.into(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn subscriptions(&self, conn_id: ConnectionId) -> Result<HashSet<String>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(HubCommand::Subscriptions { conn_id, reply })
            .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx.send(HubCommand::Stats(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of connections the Hub is currently tracking.
    pub fn live_connections(&self) -> usize {
        *self.live_rx.borrow()
    }

    /// Wait up to `deadline` for every connection to finish on its own, then
    /// force-close whatever is left. Returns the number of links force-closed.
    pub async fn drain(&self, deadline: Duration) -> Result<usize, HubError> {
        let mut live = self.live_rx.clone();
        let finished = tokio::time::timeout(deadline, live.wait_for(|count| *count == 0))
            .await
            .map(|waited| waited.is_ok());

        match finished {
            Ok(true) => {
                tracing::info!("All connections finished before drain deadline");
                Ok(0)
            }
            Ok(false) => Err(HubError::Closed),
            Err(_) => {
                let (reply, rx) = oneshot::channel();
                self.command_tx.send(HubCommand::CloseAll(reply)).await?;
                let closed = rx.await.map_err(|_| HubError::Closed)?;
                tracing::warn!(
                    closed = closed,
                    "Drain deadline elapsed, force-closed remaining connections"
                );
                Ok(closed)
            }
        }
    }
}

/// Hub-side record of one live connection.
#[derive(Debug)]
struct ConnectionEntry {
    sender: mpsc::Sender<Message>,
    addr: Option<SocketAddr>,
}

/// The Hub event loop state. Construct with [`Hub::new`] and drive with
/// [`Hub::run`], or use [`spawn_hub`].
#[derive(Debug)]
pub struct Hub {
    registry: ChannelRegistry,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    register_rx: mpsc::Receiver<MembershipChange>,
    unregister_rx: mpsc::Receiver<MembershipChange>,
    broadcast_rx: mpsc::Receiver<Message>,
    command_rx: mpsc::Receiver<HubCommand>,
    live_tx: watch::Sender<usize>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let (live_tx, live_rx) = watch::channel(0);

        let hub = Self {
            registry: ChannelRegistry::new(),
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            command_rx,
            live_tx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            command_tx,
            live_rx,
        };
        (hub, handle)
    }

    /// Process events until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        tracing::info!("Hub event loop started");

        loop {
            tokio::select! {
                Some(change) = self.register_rx.recv() => {
                    self.register(change.sub);
                    let _ = change.applied.send(());
                }
                Some(change) = self.unregister_rx.recv() => {
                    self.unregister(change.sub);
                    let _ = change.applied.send(());
                }
                Some(message) = self.broadcast_rx.recv() => self.broadcast(message),
                Some(cmd) = self.command_rx.recv() => self.handle_command(cmd),
                else => break,
            }
        }

        tracing::info!("Hub queues closed, event loop stopped");
    }

    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect { addr, reply } => {
                let conn_id = ConnectionId::new();
                let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
                self.connections
                    .insert(conn_id, ConnectionEntry { sender, addr });
                self.publish_live_count();

                tracing::debug!(
                    conn_id = %conn_id,
                    connections = self.connections.len(),
                    "Connection tracked"
                );

                if reply.send((conn_id, receiver)).is_err() {
                    // Requester went away before it got its queue
                    self.remove_connection(conn_id);
                }
            }
            HubCommand::Remove(conn_id) => self.remove_connection(conn_id),
            HubCommand::Members { channel, reply } => {
                let _ = reply.send(self.registry.members(&channel));
            }
            HubCommand::Subscriptions { conn_id, reply } => {
                let _ = reply.send(self.registry.channels_of(conn_id));
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(HubStats {
                    connections: self.connections.len(),
                    channels: self.registry.channel_count(),
                    subscriptions: self.registry.subscription_count(),
                });
            }
            HubCommand::CloseAll(reply) => {
                let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
                for conn_id in &ids {
                    self.remove_connection(*conn_id);
                }
                let _ = reply.send(ids.len());
            }
        }
    }

    fn register(&mut self, sub: Subscription) {
        // A register racing with removal must not resurrect the channel entry
        if !self.connections.contains_key(&sub.conn_id) {
            tracing::debug!(
                conn_id = %sub.conn_id,
                channel = %sub.channel,
                "Ignoring subscribe from connection that is no longer tracked"
            );
            return;
        }

        if self.registry.subscribe(sub.conn_id, &sub.channel) {
            tracing::debug!(conn_id = %sub.conn_id, channel = %sub.channel, "Subscribed");
        }
    }

    fn unregister(&mut self, sub: Subscription) {
        if self.registry.unsubscribe(sub.conn_id, &sub.channel) {
            tracing::debug!(conn_id = %sub.conn_id, channel = %sub.channel, "Unsubscribed");
        }
    }

    fn broadcast(&mut self, message: Message) {
        let members = self.registry.members(&message.channel);
        if members.is_empty() {
            tracing::trace!(channel = %message.channel, "Broadcast to channel without subscribers");
            return;
        }

        let mut ejected = Vec::new();
        for conn_id in members {
            let Some(entry) = self.connections.get(&conn_id) else {
                continue;
            };
            match entry.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        conn_id = %conn_id,
                        addr = ?entry.addr,
                        channel = %message.channel,
                        "Outbound queue full, ejecting unresponsive subscriber"
                    );
                    ejected.push(conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(conn_id = %conn_id, "Outbound queue already closed");
                    ejected.push(conn_id);
                }
            }
        }

        for conn_id in ejected {
            self.remove_connection(conn_id);
        }
    }

    /// Unregister from every channel, then drop the only sender so the queue
    /// closes exactly once.
    fn remove_connection(&mut self, conn_id: ConnectionId) {
        let Some(entry) = self.connections.remove(&conn_id) else {
            tracing::trace!(conn_id = %conn_id, "Connection already removed");
            return;
        };

        let left = self.registry.remove_connection(conn_id);
        drop(entry);
        self.publish_live_count();

        tracing::debug!(
            conn_id = %conn_id,
            channels = left.len(),
            connections = self.connections.len(),
            "Connection removed"
        );
    }

    fn publish_live_count(&self) {
        self.live_tx.send_replace(self.connections.len());
    }
}

/// Spawn the Hub event loop on the current runtime.
pub fn spawn_hub() -> HubHandle {
    let (hub, handle) = Hub::new();
    tokio::spawn(hub.run());
    handle
}
