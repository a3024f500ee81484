//! Pairing core: partner lock, blacklist, handshake state machine and the
//! engine task that drives it

pub mod engine;
pub mod lock;
pub mod machine;

pub use engine::{EngineConfig, EngineDeps, EngineHandle, EngineNotification, MatchEngine};
pub use lock::{Blacklist, LockManager};
pub use machine::{MatchAction, MatchEvent, Matchmaker, TimerKind};

use std::time::Duration;

/// Handshake timings used by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchTimings {
    /// Interval between repeated proposals
    pub proposal_retry: Duration,
    /// Deadline for a proposal or an accepted proposal to turn into a session
    pub proposal_deadline: Duration,
    /// Deadline for the session handoff itself
    pub negotiation_timeout: Duration,
    /// How long a failed peer stays blacklisted
    pub blacklist_ttl: Duration,
}

impl Default for MatchTimings {
    fn default() -> Self {
        Self {
            proposal_retry: Duration::from_millis(1500),
            proposal_deadline: Duration::from_secs(6),
            negotiation_timeout: Duration::from_secs(15),
            blacklist_ttl: Duration::from_secs(30),
        }
    }
}
