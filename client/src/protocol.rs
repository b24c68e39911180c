//! Wire format spoken with the relay.
//!
//! Outbound frames are `{"action": ..., "channel"?: ..., "payload"?: ...}`.
//! Inbound frames are either a channel event `{channel, event, payload}` or
//! the heartbeat reply `{"action":"pong"}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One client→relay action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    /// Publish to every subscriber of `channel`; the relay delivers it with
    /// event name `"message"`.
    Message { channel: String, payload: Value },
    Ping,
}

impl Action {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Action::Subscribe {
            channel: channel.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Action::Unsubscribe {
            channel: channel.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A channel event pushed by the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Pong,
    Event(Event),
}

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> Result<Incoming, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("action").and_then(Value::as_str) == Some("pong") {
        return Ok(Incoming::Pong);
    }
    serde_json::from_value(value).map(Incoming::Event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_actions_encode_as_relay_envelopes() {
        assert_eq!(
            serde_json::to_value(Action::subscribe("room1")).unwrap(),
            json!({"action": "subscribe", "channel": "room1"})
        );
        assert_eq!(
            serde_json::to_value(Action::Message {
                channel: "room1".into(),
                payload: json!({"text": "hi"}),
            })
            .unwrap(),
            json!({"action": "message", "channel": "room1", "payload": {"text": "hi"}})
        );
        assert_eq!(Action::Ping.encode().unwrap(), r#"{"action":"ping"}"#);
    }

    #[test]
    fn test_decode_pong_and_events() {
        assert_eq!(decode_frame(r#"{"action":"pong"}"#).unwrap(), Incoming::Pong);

        let decoded =
            decode_frame(r#"{"channel":"room1","event":"chat","payload":{"text":"hi"}}"#).unwrap();
        assert_eq!(
            decoded,
            Incoming::Event(Event {
                channel: "room1".into(),
                event: "chat".into(),
                payload: json!({"text": "hi"}),
            })
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"channel":"room1"}"#).is_err());
    }
}
