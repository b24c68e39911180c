pub mod actor;
pub mod handler;
pub mod protocol;

use std::time::Duration;
use tokio::sync::mpsc;

/// Maximum inbound frame size. Larger frames are a read error and tear the
/// connection down.
pub const MAX_FRAME_SIZE: usize = 512;

/// Read-liveness timeout: a link that has not answered a transport ping
/// within this window is considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(30);

/// Transport ping period, 90% of [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(27);

/// Deadline for any single frame write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Capacity of the inbound→outbound control queue.
pub const CONTROL_CAPACITY: usize = 16;

/// Frames the inbound loop asks the outbound loop to write on its behalf.
/// Kept separate from the Hub's outbound queue so heartbeats never wait
/// behind broadcast traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pong,
}

/// Held by every running connection task. [`ActorsDone::wait`] resolves once
/// all clones are dropped.
#[derive(Debug, Clone)]
pub struct ActorGuard(mpsc::Sender<()>);

#[derive(Debug)]
pub struct ActorsDone(mpsc::Receiver<()>);

impl ActorsDone {
    /// Wait until every [`ActorGuard`] is gone.
    pub async fn wait(mut self) {
        // Nothing is ever sent; recv returns None once the last sender drops
        let _ = self.0.recv().await;
    }
}

pub fn actor_tracker() -> (ActorGuard, ActorsDone) {
    let (tx, rx) = mpsc::channel(1);
    (ActorGuard(tx), ActorsDone(rx))
}
