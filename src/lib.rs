//! Roulette Room - random one-to-one video chat pairing
//!
//! Peers announce themselves on a per-region broadcast channel, lock onto a
//! single partner through a propose/accept handshake, and hand both sides over
//! to a point-to-point media and data session.

pub mod channel;
pub mod config;
pub mod error;
pub mod matchmaking;
pub mod metrics;
pub mod service;
pub mod session;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use channel::{BroadcastClient, BroadcastTransport, LocalBroadcastHub};
pub use matchmaking::{EngineConfig, EngineHandle, EngineNotification, MatchEngine, Matchmaker};
pub use session::{LocalSessionHub, MediaSource, SessionTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
