//! Common types used throughout the pairing engine

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::channel::messages::REGION_EXCHANGE_PREFIX;
use crate::error::MatchmakingError;

/// Opaque identity of a connected peer, unique for one engine instance
pub type PeerId = String;

/// Identifier of one lock acquisition; timers and session events carry it so
/// that anything left over from an abandoned attempt can be recognised
pub type AttemptId = u64;

/// Pre-provisioned broadcast regions a peer can join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    Global,
    Europe,
    Asia,
    NorthAmerica,
    SouthAmerica,
    Africa,
    Oceania,
}

impl Region {
    /// Every region, in declaration order
    pub const ALL: [Region; 7] = [
        Region::Global,
        Region::Europe,
        Region::Asia,
        Region::NorthAmerica,
        Region::SouthAmerica,
        Region::Africa,
        Region::Oceania,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Global => "global",
            Region::Europe => "europe",
            Region::Asia => "asia",
            Region::NorthAmerica => "north-america",
            Region::SouthAmerica => "south-america",
            Region::Africa => "africa",
            Region::Oceania => "oceania",
        }
    }

    /// Topic name of the region's broadcast channel
    pub fn topic(&self) -> String {
        format!("{}.{}", REGION_EXCHANGE_PREFIX, self.as_str())
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Region {
    type Err = MatchmakingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .iter()
            .copied()
            .find(|region| region.as_str() == s.to_lowercase())
            .ok_or_else(|| MatchmakingError::ConfigurationError {
                message: format!("Unknown region: {}", s),
            })
    }
}

/// Availability a peer advertises in its presence announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Searching,
    Busy,
}

/// Which side of the point-to-point session we play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    /// We proposed and open the session
    Initiator,
    /// We accepted and answer the session
    Responder,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Initiator => write!(f, "initiator"),
            SessionRole::Responder => write!(f, "responder"),
        }
    }
}

/// Internal state of the matchmaking state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchState {
    /// No local media yet
    Idle,
    /// Broadcasting presence, unlocked
    Matching,
    /// Locked on a peer we proposed to
    Proposing { peer_id: PeerId },
    /// Locked on a peer whose proposal we accepted
    Accepting { peer_id: PeerId },
    /// Session handoff in progress
    Negotiating { peer_id: PeerId, role: SessionRole },
    /// Active session established
    Connected { peer_id: PeerId, role: SessionRole },
}

impl MatchState {
    /// Partner the state is committed to, if any
    pub fn partner(&self) -> Option<&PeerId> {
        match self {
            MatchState::Idle | MatchState::Matching => None,
            MatchState::Proposing { peer_id }
            | MatchState::Accepting { peer_id }
            | MatchState::Negotiating { peer_id, .. }
            | MatchState::Connected { peer_id, .. } => Some(peer_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MatchState::Idle => "idle",
            MatchState::Matching => "matching",
            MatchState::Proposing { .. } => "proposing",
            MatchState::Accepting { .. } => "accepting",
            MatchState::Negotiating { .. } => "negotiating",
            MatchState::Connected { .. } => "connected",
        }
    }
}

/// Status observed by the surrounding application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStatus {
    Idle,
    AcquiringMedia,
    Matching,
    Negotiating,
    Connected,
    Disconnected,
    ChannelOffline,
    FatalError,
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MatchStatus::Idle => "idle",
            MatchStatus::AcquiringMedia => "acquiring-media",
            MatchStatus::Matching => "matching",
            MatchStatus::Negotiating => "negotiating",
            MatchStatus::Connected => "connected",
            MatchStatus::Disconnected => "disconnected",
            MatchStatus::ChannelOffline => "channel-offline",
            MatchStatus::FatalError => "fatal-error",
        };
        write!(f, "{}", label)
    }
}

/// Reason a partner was abandoned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    /// Local user asked for the next partner
    Skipped,
    /// Local user skipped and asked to avoid this partner for a while
    Reported,
    /// Remote side closed the session cleanly
    RemoteClosed,
    /// Remote side announced it left the channel
    RemoteLeft,
    /// No accept, session request, or session within the deadline
    HandshakeTimeout,
    /// The session errored out
    SessionError(String),
    /// The local engine is stopping
    Shutdown,
}

impl LeaveReason {
    /// Whether this path adds the former partner to the blacklist
    pub fn blacklists(&self) -> bool {
        matches!(
            self,
            LeaveReason::Reported | LeaveReason::HandshakeTimeout | LeaveReason::SessionError(_)
        )
    }

    /// Short label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            LeaveReason::Skipped => "skipped",
            LeaveReason::Reported => "reported",
            LeaveReason::RemoteClosed => "remote_closed",
            LeaveReason::RemoteLeft => "remote_left",
            LeaveReason::HandshakeTimeout => "handshake_timeout",
            LeaveReason::SessionError(_) => "session_error",
            LeaveReason::Shutdown => "shutdown",
        }
    }
}

/// Remote media stream delivered by the session layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub peer_id: PeerId,
    pub stream_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_parsing_and_topic() {
        assert_eq!("europe".parse::<Region>().unwrap(), Region::Europe);
        assert_eq!("North-America".parse::<Region>().unwrap(), Region::NorthAmerica);
        assert!("mars".parse::<Region>().is_err());
        assert_eq!(Region::Asia.topic(), "roulette.region.asia");
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&MatchStatus::ChannelOffline).unwrap();
        assert_eq!(json, "\"channel-offline\"");
        assert_eq!(MatchStatus::AcquiringMedia.to_string(), "acquiring-media");
    }

    #[test]
    fn test_leave_reason_blacklisting() {
        assert!(LeaveReason::HandshakeTimeout.blacklists());
        assert!(LeaveReason::SessionError("ice".to_string()).blacklists());
        assert!(!LeaveReason::RemoteLeft.blacklists());
        assert!(!LeaveReason::RemoteClosed.blacklists());
        assert!(!LeaveReason::Skipped.blacklists());
        assert!(LeaveReason::Reported.blacklists());
    }

    #[test]
    fn test_state_partner() {
        assert_eq!(MatchState::Matching.partner(), None);
        let state = MatchState::Negotiating {
            peer_id: "peer-b".to_string(),
            role: SessionRole::Initiator,
        };
        assert_eq!(state.partner(), Some(&"peer-b".to_string()));
        assert_eq!(state.name(), "negotiating");
    }
}
