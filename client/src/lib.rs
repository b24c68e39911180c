//! Client runtime for the pushpop relay.
//!
//! ```no_run
//! # async fn demo() -> Result<(), pushpop_client::ClientError> {
//! let client = pushpop_client::Client::connect("ws://127.0.0.1:8945/ws")?;
//! let room = client.subscribe("room1")?;
//! room.bind("chat", |payload| println!("chat: {payload}"));
//! client.wait_terminal().await
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod state;

pub use channel::{Channel, HandlerId};
pub use connection::Client;
pub use error::ClientError;
pub use state::{ConnectionState, Heartbeat, Reconnect, ReconnectPolicy};
