use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::hub::{ConnectionId, HubHandle, Message};
use crate::ws::Control;

/// Application-level heartbeat reply, written verbatim.
pub const PONG_FRAME: &str = r#"{"action":"pong"}"#;

/// Event name given to messages published by clients over the socket.
pub const CLIENT_MESSAGE_EVENT: &str = "message";

/// Client→server JSON envelope: `{action, channel?, payload?}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    action: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

/// A decoded, validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Subscribe(String),
    Unsubscribe(String),
    Publish(Message),
    Ping,
}

/// Reasons a single frame is dropped. None of these close the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0} without a channel")]
    MissingChannel(&'static str),

    #[error("unhandled action {0:?}")]
    UnknownAction(String),
}

/// Whether the inbound loop should keep reading after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Decode one text frame into a [`Request`].
pub fn parse_request(text: &str) -> Result<Request, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let channel = envelope.channel.filter(|c| !c.is_empty());

    match envelope.action.as_str() {
        "ping" => Ok(Request::Ping),
        "subscribe" => channel
            .map(Request::Subscribe)
            .ok_or(ProtocolError::MissingChannel("subscribe")),
        "unsubscribe" => channel
            .map(Request::Unsubscribe)
            .ok_or(ProtocolError::MissingChannel("unsubscribe")),
        "message" => channel
            .map(|channel| {
                Request::Publish(Message::new(
                    channel,
                    CLIENT_MESSAGE_EVENT,
                    envelope.payload,
                ))
            })
            .ok_or(ProtocolError::MissingChannel("message")),
        other => Err(ProtocolError::UnknownAction(other.to_string())),
    }
}

/// Handle an incoming text frame: decode, then forward to the Hub or answer
/// a heartbeat. Protocol errors are logged and the frame is discarded.
pub async fn handle_text_message(
    text: &str,
    conn_id: ConnectionId,
    hub: &HubHandle,
    control_tx: &mpsc::Sender<Control>,
) -> Flow {
    let request = match parse_request(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(
                conn_id = %conn_id,
                error = %e,
                frame = %text.chars().take(100).collect::<String>(),
                "Dropping client frame"
            );
            return Flow::Continue;
        }
    };

    let delivered = match request {
        Request::Ping => {
            if control_tx.send(Control::Pong).await.is_err() {
                tracing::debug!(conn_id = %conn_id, "Writer gone before pong could be sent");
                return Flow::Stop;
            }
            return Flow::Continue;
        }
        Request::Subscribe(channel) => {
            tracing::info!(conn_id = %conn_id, channel = %channel, "Client subscribed");
            hub.register(conn_id, channel).await
        }
        Request::Unsubscribe(channel) => {
            tracing::info!(conn_id = %conn_id, channel = %channel, "Client unsubscribed");
            hub.unregister(conn_id, channel).await
        }
        Request::Publish(message) => {
            tracing::debug!(conn_id = %conn_id, channel = %message.channel, "Client published");
            hub.broadcast(message).await
        }
    };

    match delivered {
        Ok(()) => Flow::Continue,
        Err(e) => {
            tracing::error!(conn_id = %conn_id, error = %e, "Hub unreachable");
            Flow::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe_and_unsubscribe() {
        assert_eq!(
            parse_request(r#"{"action":"subscribe","channel":"room1"}"#).unwrap(),
            Request::Subscribe("room1".to_string())
        );
        assert_eq!(
            parse_request(r#"{"action":"unsubscribe","channel":"room1"}"#).unwrap(),
            Request::Unsubscribe("room1".to_string())
        );
    }

    #[test]
    fn test_parse_message_uses_fixed_event_name() {
        let request =
            parse_request(r#"{"action":"message","channel":"room1","payload":{"n":1}}"#).unwrap();
        assert_eq!(
            request,
            Request::Publish(Message::new("room1", "message", json!({"n": 1})))
        );
    }

    #[test]
    fn test_parse_ping_ignores_channel() {
        assert_eq!(parse_request(r#"{"action":"ping"}"#).unwrap(), Request::Ping);
        assert_eq!(
            parse_request(r#"{"action":"ping","channel":"x"}"#).unwrap(),
            Request::Ping
        );
    }

    #[test]
    fn test_missing_or_empty_channel_rejected() {
        for frame in [
            r#"{"action":"subscribe"}"#,
            r#"{"action":"unsubscribe","channel":""}"#,
            r#"{"action":"message","payload":1}"#,
        ] {
            assert!(
                matches!(parse_request(frame), Err(ProtocolError::MissingChannel(_))),
                "expected missing channel for {}",
                frame
            );
        }
    }

    #[test]
    fn test_unknown_action_and_malformed_json() {
        assert!(matches!(
            parse_request(r#"{"action":"dance","channel":"room1"}"#),
            Err(ProtocolError::UnknownAction(a)) if a == "dance"
        ));
        assert!(matches!(
            parse_request(r#"{"channel":"room1"}"#),
            Err(ProtocolError::UnknownAction(a)) if a.is_empty()
        ));
        assert!(matches!(
            parse_request("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_requests_pong_from_writer() {
        let hub = crate::hub::spawn_hub();
        let (conn_id, _outbound) = hub.connect(None).await.unwrap();
        let (control_tx, mut control_rx) = mpsc::channel(4);

        let flow = handle_text_message(r#"{"action":"ping"}"#, conn_id, &hub, &control_tx).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(control_rx.try_recv().unwrap(), Control::Pong);
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_frame_keeps_connection_open() {
        let hub = crate::hub::spawn_hub();
        let (conn_id, _outbound) = hub.connect(None).await.unwrap();
        let (control_tx, _control_rx) = mpsc::channel(4);

        let flow = handle_text_message("{oops", conn_id, &hub, &control_tx).await;
        assert_eq!(flow, Flow::Continue);
    }
}
