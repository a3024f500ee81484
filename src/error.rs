//! Error types for the pairing engine
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application. Peer-level failures are absorbed by the engine and
//! turned into a return to matching; the variants below are what can still reach
//! a caller.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific pairing scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Broadcast channel connection failed: {message}")]
    ChannelConnectionFailed { message: String },

    #[error("Broadcast channel closed")]
    ChannelClosed,

    #[error("Invalid channel message: {reason}")]
    InvalidMessage { reason: String },

    #[error("Peer unreachable: {peer_id}")]
    PeerUnreachable { peer_id: String },

    #[error("Session rejected by peer: {peer_id}")]
    SessionRejected { peer_id: String },

    #[error("Session failed: {reason}")]
    SessionFailed { reason: String },

    #[error("No active session")]
    SessionNotActive,

    #[error("Local media unavailable: {reason}")]
    MediaUnavailable { reason: String },

    #[error("Engine is not running")]
    EngineStopped,

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}
