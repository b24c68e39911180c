use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant};

use crate::hub::{ConnectionId, HubHandle, OutboundReceiver};
use crate::ws::protocol::{self, Flow, PONG_FRAME};
use crate::ws::{ActorGuard, Control, CONTROL_CAPACITY, PING_PERIOD, PONG_WAIT, WRITE_WAIT};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;

/// Run one connection: a spawned outbound loop plus the inbound loop on the
/// current task.
///
/// The two loops share nothing but the outbound queue (via the Hub) and the
/// control queue. Whichever loop stops first removes the connection from the
/// Hub; the other one follows once the socket or its queue closes.
///
/// Both loops hold a clone of `guard` until they return.
pub async fn run_connection(
    socket: WebSocket,
    hub: HubHandle,
    addr: SocketAddr,
    guard: ActorGuard,
) {
    let (conn_id, outbound) = match hub.connect(Some(addr)).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Cannot track connection, dropping socket");
            return;
        }
    };

    let (ws_sender, ws_receiver) = socket.split();
    let (control_tx, control_rx) = mpsc::channel::<Control>(CONTROL_CAPACITY);
    let teardown = Arc::new(Teardown::new(hub.clone(), conn_id));

    tracing::info!(conn_id = %conn_id, addr = %addr, "WebSocket actor started");

    let writer = tokio::spawn(write_loop(
        ws_sender,
        outbound,
        control_rx,
        Arc::clone(&teardown),
        guard.clone(),
    ));

    read_loop(ws_receiver, conn_id, &hub, control_tx, writer).await;
    teardown.run("read loop finished").await;

    tracing::info!(conn_id = %conn_id, addr = %addr, "WebSocket actor stopped");
    drop(guard);
}

/// Exactly-once removal shared by both loops.
struct Teardown {
    hub: HubHandle,
    conn_id: ConnectionId,
    done: AtomicBool,
}

impl Teardown {
    fn new(hub: HubHandle, conn_id: ConnectionId) -> Self {
        Self {
            hub,
            conn_id,
            done: AtomicBool::new(false),
        }
    }

    async fn run(&self, reason: &str) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(conn_id = %self.conn_id, reason = reason, "Removing connection from hub");
        if let Err(e) = self.hub.remove_connection(self.conn_id).await {
            tracing::warn!(conn_id = %self.conn_id, error = %e, "Hub gone during teardown");
        }
    }
}

/// Inbound loop: one frame at a time until close, error, liveness timeout,
/// or the outbound loop finishing.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    conn_id: ConnectionId,
    hub: &HubHandle,
    control_tx: mpsc::Sender<Control>,
    mut writer: JoinHandle<()>,
) {
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let next = tokio::select! {
            next = timeout_at(deadline, stream.next()) => next,
            _ = &mut writer => {
                tracing::debug!(conn_id = %conn_id, "Writer finished, stopping reader");
                return;
            }
        };

        let frame = match next {
            Err(_) => {
                tracing::warn!(conn_id = %conn_id, "No pong within liveness window, closing");
                return;
            }
            Ok(None) => {
                tracing::info!(conn_id = %conn_id, "WebSocket stream ended");
                return;
            }
            Ok(Some(Err(e))) => {
                log_socket_error(conn_id, "read", &e);
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => {
                let flow =
                    protocol::handle_text_message(text.as_str(), conn_id, hub, &control_tx).await;
                if flow == Flow::Stop {
                    return;
                }
            }
            WsMessage::Binary(data) => {
                tracing::warn!(
                    conn_id = %conn_id,
                    len = data.len(),
                    "Unsupported binary frame, skipping"
                );
            }
            WsMessage::Pong(_) => {
                deadline = Instant::now() + PONG_WAIT;
            }
            WsMessage::Ping(_) => {
                // Answered by the protocol layer
                tracing::trace!(conn_id = %conn_id, "Transport ping");
            }
            WsMessage::Close(frame) => {
                log_close_frame(conn_id, frame.as_ref());
                return;
            }
        }
    }
}

/// Outbound loop: drains the Hub queue and control queue onto the socket and
/// sends a transport ping every [`PING_PERIOD`].
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: OutboundReceiver,
    mut control_rx: mpsc::Receiver<Control>,
    teardown: Arc<Teardown>,
    _guard: ActorGuard,
) {
    let conn_id = teardown.conn_id;
    let mut ping_timer = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    let mut control_open = true;

    let reason = loop {
        tokio::select! {
            biased;

            control = control_rx.recv(), if control_open => match control {
                Some(Control::Pong) => {
                    let pong = WsMessage::Text(Utf8Bytes::from_static(PONG_FRAME));
                    if let Err(e) = write_frame(&mut sink, pong).await {
                        log_write_error(conn_id, "pong", &e);
                        break "pong write failed";
                    }
                }
                None => control_open = false,
            },

            queued = outbound.recv() => match queued {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(conn_id = %conn_id, error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = write_frame(&mut sink, WsMessage::Text(text.into())).await {
                        log_write_error(conn_id, "message", &e);
                        break "message write failed";
                    }
                }
                None => {
                    // The Hub closed the queue
                    let _ = write_frame(&mut sink, WsMessage::Close(None)).await;
                    break "outbound queue closed";
                }
            },

            _ = ping_timer.tick() => {
                if let Err(e) = write_frame(&mut sink, WsMessage::Ping(Bytes::new())).await {
                    log_write_error(conn_id, "ping", &e);
                    break "ping write failed";
                }
            }
        }
    };

    teardown.run(reason).await;
    let _ = timeout(WRITE_WAIT, sink.close()).await;
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write deadline exceeded")]
    Deadline,

    #[error(transparent)]
    Socket(#[from] axum::Error),
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: WsMessage,
) -> Result<(), WriteError> {
    timeout(WRITE_WAIT, sink.send(frame))
        .await
        .map_err(|_| WriteError::Deadline)??;
    Ok(())
}

/// How a socket failure should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    Clean,
    Reset,
    Failed,
}

fn classify(err: &axum::Error) -> Disconnect {
    let text = err.to_string().to_lowercase();
    if text.contains("closed normally") || text.contains("closed connection") {
        Disconnect::Clean
    } else if text.contains("reset") {
        Disconnect::Reset
    } else {
        Disconnect::Failed
    }
}

fn log_socket_error(conn_id: ConnectionId, op: &str, err: &axum::Error) {
    match classify(err) {
        Disconnect::Clean => {
            tracing::info!(conn_id = %conn_id, op = op, "WebSocket closed by client");
        }
        Disconnect::Reset => {
            tracing::info!(conn_id = %conn_id, op = op, "Connection reset by peer, cleaning up");
        }
        Disconnect::Failed => {
            tracing::warn!(conn_id = %conn_id, op = op, error = %err, "WebSocket error");
        }
    }
}

fn log_write_error(conn_id: ConnectionId, what: &str, err: &WriteError) {
    match err {
        WriteError::Deadline => {
            tracing::warn!(conn_id = %conn_id, frame = what, "Write deadline exceeded");
        }
        WriteError::Socket(e) => log_socket_error(conn_id, what, e),
    }
}

fn log_close_frame(conn_id: ConnectionId, frame: Option<&CloseFrame>) {
    match frame {
        Some(frame) if frame.code != CLOSE_NORMAL && frame.code != CLOSE_GOING_AWAY => {
            tracing::warn!(
                conn_id = %conn_id,
                code = frame.code,
                reason = %frame.reason.as_str(),
                "Client closed with abnormal code"
            );
        }
        _ => {
            tracing::info!(
                conn_id = %conn_id,
                code = ?frame.map(|f| f.code),
                "WebSocket closed by client"
            );
        }
    }
}
