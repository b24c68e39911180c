use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Every scheduled reconnect failed. Terminal.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The background connection task is no longer running.
    #[error("client runtime has stopped")]
    Closed,

    #[error("invalid relay url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}
