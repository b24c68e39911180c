//! HTTP publish entry point.
//!
//! Injects one externally submitted message into the Hub's broadcast path
//! without going through any WebSocket connection. Only POST is routed, so
//! axum answers every other method with 405.

use axum::{body::Bytes, extract::State, http::StatusCode};
use std::time::Duration;

use crate::error::TriggerError;
use crate::hub::Message;
use crate::state::AppState;

/// Upper bound on decode plus hand-off to the Hub.
pub const TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);

/// POST /trigger with body `{channel, event, payload}`.
///
/// 200 once the Hub has accepted the broadcast. Delivery to individual
/// subscribers is not awaited.
pub async fn trigger(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, TriggerError> {
    let message = tokio::time::timeout(TRIGGER_TIMEOUT, async {
        let message = decode_message(&body)?;
        state.hub.broadcast(message.clone()).await?;
        Ok::<_, TriggerError>(message)
    })
    .await
    .map_err(|_| TriggerError::Timeout)
    .and_then(|accepted| accepted)
    .inspect_err(|e| {
        tracing::warn!(error = %e, status = %e.status(), "Trigger rejected");
    })?;

    tracing::debug!(
        channel = %message.channel,
        event = %message.event,
        "Trigger accepted"
    );

    Ok(StatusCode::OK)
}

/// Decode and validate a trigger body.
pub fn decode_message(body: &[u8]) -> Result<Message, TriggerError> {
    let message: Message = serde_json::from_slice(body)?;
    if message.channel.is_empty() {
        return Err(TriggerError::MissingChannel);
    }
    Ok(message)
}
