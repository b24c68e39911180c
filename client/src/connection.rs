//! Auto-reconnecting relay connection.
//!
//! A [`Client`] owns a background task that connects, replays subscriptions,
//! routes inbound events to [`Channel`] tables and reconnects with backoff.
//!
//! ```text
//!   Client ──Command──► connection task ──frames──► relay
//!     │                      │
//!     │ subscribe("room1")   │ on_open: flush buffered actions,
//!     ▼                      │          resubscribe tracked channels
//!   Arc<Channel> ◄─trigger───┘ inbound {channel, event, payload}
//! ```

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::Channel;
use crate::error::ClientError;
use crate::protocol::{self, Action, Incoming};
use crate::state::{
    Beat, ConnectionState, Heartbeat, Reconnect, ReconnectPolicy, Session, CLOSE_ABNORMAL,
    CLOSE_NORMAL, CLOSE_NO_STATUS,
};

/// Application-level ping period while the link is open. A ping left
/// unanswered for one period closes the link with 1006.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(25);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type ChannelTable = Arc<DashMap<String, Arc<Channel>>>;

#[derive(Debug)]
enum Command {
    Send(Action),
    Disconnect,
}

/// Handle to one relay connection. Dropping it shuts the connection down.
#[derive(Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    channels: ChannelTable,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Start connecting to `url` (e.g. `ws://127.0.0.1:8945/ws`) with the
    /// default reconnect policy. Must be called inside a tokio runtime.
    pub fn connect(url: &str) -> Result<Self, ClientError> {
        Self::connect_with(url, ReconnectPolicy::default())
    }

    pub fn connect_with(url: &str, policy: ReconnectPolicy) -> Result<Self, ClientError> {
        url.into_client_request()
            .map_err(|e| ClientError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let channels: ChannelTable = Arc::new(DashMap::new());

        let driver = Driver {
            url: url.to_string(),
            session: Session::new(policy),
            commands: command_rx,
            channels: Arc::clone(&channels),
            state_tx,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            commands,
            channels,
            state_rx,
        })
    }

    /// Subscribe to `name` and return its callback table. Subscribing to a
    /// channel that is already tracked returns the existing table.
    ///
    /// If the link is down the subscribe is buffered and sent on the next
    /// open; after every reconnect the subscription is replayed.
    pub fn subscribe(&self, name: &str) -> Result<Arc<Channel>, ClientError> {
        let mut created = false;
        let channel = Arc::clone(
            self.channels
                .entry(name.to_string())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Channel::new(name))
                })
                .value(),
        );

        if created {
            self.send(Action::subscribe(name))?;
        }
        Ok(channel)
    }

    /// Stop tracking `name` and drop its callback table.
    pub fn unsubscribe(&self, name: &str) -> Result<(), ClientError> {
        if self.channels.remove(name).is_some() {
            self.send(Action::unsubscribe(name))?;
        }
        Ok(())
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Publish `payload` to every subscriber of `channel`, including this
    /// client if it is subscribed. Subscribers see event name `"message"`.
    pub fn publish(&self, channel: &str, payload: Value) -> Result<(), ClientError> {
        self.send(Action::Message {
            channel: channel.to_string(),
            payload,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Resolve once the link is open.
    pub async fn wait_open(&self) -> Result<(), ClientError> {
        let mut rx = self.state_rx.clone();
        let state = *rx
            .wait_for(|state| *state == ConnectionState::Open || state.is_terminal())
            .await
            .map_err(|_| ClientError::Closed)?;
        match state {
            ConnectionState::Open => Ok(()),
            other => Err(terminal_error(other)),
        }
    }

    /// Resolve once the client stops for good: `Ok` after a normal close,
    /// [`ClientError::ReconnectExhausted`] once retries run out.
    pub async fn wait_terminal(&self) -> Result<(), ClientError> {
        let mut rx = self.state_rx.clone();
        let state = *rx
            .wait_for(ConnectionState::is_terminal)
            .await
            .map_err(|_| ClientError::Closed)?;
        match state {
            ConnectionState::Closed {
                reconnect: Reconnect::GiveUp { attempts },
                ..
            } => Err(ClientError::ReconnectExhausted { attempts }),
            _ => Ok(()),
        }
    }

    /// Close with code 1000. No reconnect is scheduled afterwards.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    fn send(&self, action: Action) -> Result<(), ClientError> {
        self.commands
            .send(Command::Send(action))
            .map_err(|_| ClientError::Closed)
    }
}

fn terminal_error(state: ConnectionState) -> ClientError {
    match state {
        ConnectionState::Closed {
            reconnect: Reconnect::GiveUp { attempts },
            ..
        } => ClientError::ReconnectExhausted { attempts },
        _ => ClientError::Closed,
    }
}

/// Result of one open link.
enum LinkExit {
    /// The link dropped with this close code.
    Closed(u16),
    /// The application asked to stop.
    Shutdown,
}

struct Driver {
    url: String,
    session: Session,
    commands: mpsc::UnboundedReceiver<Command>,
    channels: ChannelTable,
    state_tx: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.session.on_connecting();
            self.publish_state();
            tracing::info!(url = %self.url, attempt = self.session.attempts(), "Connecting to relay");

            let code = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    let (mut sink, mut source) = ws.split();
                    let backlog = self.session.on_open();
                    self.publish_state();
                    tracing::info!(url = %self.url, replayed = backlog.len(), "Connected to relay");

                    match self.run_link(&mut sink, &mut source, backlog).await {
                        LinkExit::Closed(code) => code,
                        LinkExit::Shutdown => {
                            self.stop();
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "Connection failed");
                    CLOSE_ABNORMAL
                }
            };

            let reconnect = self.session.on_close(code, &mut rand::rng());
            self.publish_state();

            match reconnect {
                Reconnect::After(delay) => {
                    tracing::info!(
                        code = code,
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.session.attempts(),
                        "Disconnected, reconnecting"
                    );
                    if !self.backoff(delay).await {
                        self.stop();
                        return;
                    }
                }
                Reconnect::Never => {
                    tracing::info!(code = code, "Relay closed the connection normally");
                    return;
                }
                Reconnect::GiveUp { attempts } => {
                    tracing::error!(attempts = attempts, "Reconnect attempts exhausted, giving up");
                    return;
                }
            }
        }
    }

    /// Drive one open link until it drops or the application stops.
    async fn run_link(
        &mut self,
        sink: &mut WsSink,
        source: &mut WsSource,
        backlog: Vec<Action>,
    ) -> LinkExit {
        for action in &backlog {
            if let Err(e) = write_action(sink, action).await {
                tracing::warn!(error = %e, "Failed to flush buffered action");
                return LinkExit::Closed(CLOSE_ABNORMAL);
            }
        }

        let mut ticks = interval_at(Instant::now() + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD);
        let mut heartbeat = Heartbeat::default();

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if dispatch(&self.channels, text.as_str()) == Dispatched::Pong {
                            heartbeat.on_pong();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map_or(CLOSE_NO_STATUS, |f| u16::from(f.code));
                        tracing::info!(code = code, "Relay sent close frame");
                        return LinkExit::Closed(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket error");
                        return LinkExit::Closed(CLOSE_ABNORMAL);
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return LinkExit::Closed(CLOSE_ABNORMAL);
                    }
                },

                command = self.commands.recv() => match command {
                    Some(Command::Send(action)) => {
                        let Some(action) = self.session.submit(action) else {
                            continue;
                        };
                        if let Err(e) = write_action(sink, &action).await {
                            tracing::warn!(error = %e, "Failed to send action");
                            return LinkExit::Closed(CLOSE_ABNORMAL);
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        let _ = sink.close().await;
                        return LinkExit::Shutdown;
                    }
                },

                _ = ticks.tick() => {
                    if heartbeat.on_tick() == Beat::Stale {
                        tracing::warn!("No pong within heartbeat period, dropping link");
                        return LinkExit::Closed(CLOSE_ABNORMAL);
                    }
                    if let Err(e) = write_action(sink, &Action::Ping).await {
                        tracing::warn!(error = %e, "Failed to send heartbeat");
                        return LinkExit::Closed(CLOSE_ABNORMAL);
                    }
                }
            }
        }
    }

    /// Sleep out a reconnect delay while still buffering actions. Returns
    /// false if the application stopped meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let wake = tokio::time::sleep(delay);
        tokio::pin!(wake);

        loop {
            tokio::select! {
                _ = &mut wake => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send(action)) => {
                        self.session.submit(action);
                    }
                    Some(Command::Disconnect) | None => return false,
                },
            }
        }
    }

    fn stop(&mut self) {
        self.session.on_close(CLOSE_NORMAL, &mut rand::rng());
        self.publish_state();
        tracing::info!("Client disconnected");
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.session.state());
    }
}

async fn write_action(
    sink: &mut WsSink,
    action: &Action,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = match action.encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode action");
            return Ok(());
        }
    };
    sink.send(Message::text(text)).await
}

#[derive(Debug, PartialEq, Eq)]
enum Dispatched {
    Pong,
    Event,
    Dropped,
}

/// Route one inbound frame to its channel table. Frames that fail to decode
/// or name an untracked channel are dropped.
fn dispatch(channels: &DashMap<String, Arc<Channel>>, text: &str) -> Dispatched {
    let event = match protocol::decode_frame(text) {
        Ok(Incoming::Pong) => {
            tracing::trace!("Heartbeat acknowledged");
            return Dispatched::Pong;
        }
        Ok(Incoming::Event(event)) => event,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring undecodable frame");
            return Dispatched::Dropped;
        }
    };

    let Some(channel) = channels
        .get(&event.channel)
        .map(|entry| Arc::clone(entry.value()))
    else {
        tracing::debug!(channel = %event.channel, "Ignoring event for untracked channel");
        return Dispatched::Dropped;
    };

    let handled = channel.trigger(&event.event, &event.payload);
    tracing::trace!(
        channel = %event.channel,
        event = %event.event,
        handled = handled,
        "Dispatched event"
    );
    Dispatched::Event
}
