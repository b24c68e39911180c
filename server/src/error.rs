use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Failure to reach the Hub's event loop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("hub event loop is not running")]
    Closed,
}

impl<T> From<SendError<T>> for HubError {
    fn from(_: SendError<T>) -> Self {
        HubError::Closed
    }
}

/// Errors surfaced by the trigger endpoint.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid request body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message channel must not be empty")]
    MissingChannel,

    #[error("timed out handing message to the hub")]
    Timeout,

    #[error("hub unavailable")]
    Unavailable(#[from] HubError),
}

impl TriggerError {
    pub fn status(&self) -> StatusCode {
        match self {
            TriggerError::Decode(_) | TriggerError::MissingChannel => StatusCode::BAD_REQUEST,
            TriggerError::Timeout => StatusCode::REQUEST_TIMEOUT,
            TriggerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
