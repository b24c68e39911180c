//! Connection state machine, independent of any socket.
//!
//! [`Session`] decides what to write when a link opens, what to buffer while
//! it is down, and whether (and when) to try again after it closes. The async
//! driver in [`crate::connection`] feeds it transitions and executes whatever
//! it returns.

use rand::Rng;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::Duration;

use crate::protocol::Action;

/// Peer closed cleanly.
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer is going away (server shutdown, page navigation).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Link dropped without a close frame, or never came up.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter)`.
    pub max_jitter: Duration,
    /// Closing with this many reconnects already scheduled is terminal.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_jitter: Duration::from_millis(500),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, cap)`, without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap)
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let max_jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if max_jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..max_jitter_ms))
        };
        self.nominal_delay(attempt) + jitter
    }
}

/// What happens after a link closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    After(Duration),
    Never,
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed { code: u16, reconnect: Reconnect },
}

impl ConnectionState {
    /// No further connection attempt will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed {
                reconnect: Reconnect::Never | Reconnect::GiveUp { .. },
                ..
            }
        )
    }
}

#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    pending: VecDeque<Action>,
    channels: BTreeSet<String>,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl Session {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Connecting,
            pending: VecDeque::new(),
            channels: BTreeSet::new(),
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnects scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Channels the application currently wants to be subscribed to.
    pub fn tracked_channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept an outbound action. Returns it back if it should be written
    /// right away; otherwise it is buffered until the next open.
    pub fn submit(&mut self, action: Action) -> Option<Action> {
        match &action {
            Action::Subscribe { channel } => {
                self.channels.insert(channel.clone());
            }
            Action::Unsubscribe { channel } => {
                self.channels.remove(channel);
            }
            Action::Message { .. } | Action::Ping => {}
        }

        if self.state == ConnectionState::Open {
            Some(action)
        } else {
            self.pending.push_back(action);
            None
        }
    }

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The link is up. Returns every frame to write, in order: the buffered
    /// actions first, then a subscribe for each tracked channel the buffer
    /// did not already leave subscribed.
    pub fn on_open(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Open;
        self.attempts = 0;

        let mut frames: Vec<Action> = self.pending.drain(..).collect();

        let mut covered = HashSet::new();
        for action in &frames {
            match action {
                Action::Subscribe { channel } => {
                    covered.insert(channel.clone());
                }
                Action::Unsubscribe { channel } => {
                    covered.remove(channel);
                }
                Action::Message { .. } | Action::Ping => {}
            }
        }

        let replay: Vec<Action> = self
            .channels
            .iter()
            .filter(|channel| !covered.contains(*channel))
            .map(|channel| Action::subscribe(channel.as_str()))
            .collect();
        frames.extend(replay);
        frames
    }

    /// The link closed with `code`. Decides whether to reconnect.
    pub fn on_close<R: Rng + ?Sized>(&mut self, code: u16, rng: &mut R) -> Reconnect {
        let reconnect = if code == CLOSE_NORMAL || code == CLOSE_GOING_AWAY {
            Reconnect::Never
        } else if self.attempts >= self.policy.max_attempts {
            Reconnect::GiveUp {
                attempts: self.attempts,
            }
        } else {
            let delay = self.policy.delay(self.attempts, rng);
            self.attempts += 1;
            Reconnect::After(delay)
        };

        self.state = ConnectionState::Closed { code, reconnect };
        reconnect
    }
}

/// What a heartbeat tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send an application ping.
    Ping,
    /// The previous ping was never answered; the link is dead.
    Stale,
}

/// Pong watchdog for one open link. A ping must be answered before the next
/// tick.
#[derive(Debug, Default)]
pub struct Heartbeat {
    awaiting_pong: bool,
}

impl Heartbeat {
    pub fn on_tick(&mut self) -> Beat {
        if self.awaiting_pong {
            return Beat::Stale;
        }
        self.awaiting_pong = true;
        Beat::Ping
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }
}
