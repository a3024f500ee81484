//! Broadcast channel message definitions and serialization

use crate::error::{MatchmakingError, Result};
use crate::types::{PeerId, PresenceStatus};
use serde::{Deserialize, Serialize};

/// Prefix of the per-region fanout exchanges
pub const REGION_EXCHANGE_PREFIX: &str = "roulette.region";

/// Prefix of the per-peer subscription queues
pub const PEER_QUEUE_PREFIX: &str = "roulette.peer";

/// Every record published on a region channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    /// A peer announces it is looking for a partner
    #[serde(rename = "presence")]
    Presence {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        status: PresenceStatus,
    },
    /// `from_id` proposes pairing with `target_id`
    #[serde(rename = "match-propose")]
    MatchPropose {
        #[serde(rename = "fromId")]
        from_id: PeerId,
        #[serde(rename = "targetId")]
        target_id: PeerId,
    },
    /// `from_id` accepts the proposal of `target_id`
    #[serde(rename = "match-accept")]
    MatchAccept {
        #[serde(rename = "fromId")]
        from_id: PeerId,
        #[serde(rename = "targetId")]
        target_id: PeerId,
    },
    /// A peer is leaving the channel on purpose
    #[serde(rename = "leave")]
    Leave {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

impl ChannelMessage {
    pub fn presence(peer_id: &str) -> Self {
        ChannelMessage::Presence {
            peer_id: peer_id.to_string(),
            status: PresenceStatus::Searching,
        }
    }

    pub fn propose(from_id: &str, target_id: &str) -> Self {
        ChannelMessage::MatchPropose {
            from_id: from_id.to_string(),
            target_id: target_id.to_string(),
        }
    }

    pub fn accept(from_id: &str, target_id: &str) -> Self {
        ChannelMessage::MatchAccept {
            from_id: from_id.to_string(),
            target_id: target_id.to_string(),
        }
    }

    pub fn leave(peer_id: &str) -> Self {
        ChannelMessage::Leave {
            peer_id: peer_id.to_string(),
        }
    }

    /// Wire discriminant, also used as a metrics label
    pub fn msg_type(&self) -> &'static str {
        match self {
            ChannelMessage::Presence { .. } => "presence",
            ChannelMessage::MatchPropose { .. } => "match-propose",
            ChannelMessage::MatchAccept { .. } => "match-accept",
            ChannelMessage::Leave { .. } => "leave",
        }
    }

    /// Identity of the peer that published the message
    pub fn sender(&self) -> &str {
        match self {
            ChannelMessage::Presence { peer_id, .. } | ChannelMessage::Leave { peer_id } => {
                peer_id
            }
            ChannelMessage::MatchPropose { from_id, .. }
            | ChannelMessage::MatchAccept { from_id, .. } => from_id,
        }
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Serialize a channel message to bytes
    pub fn serialize(message: &ChannelMessage) -> Result<Vec<u8>> {
        Self::validate(message)?;
        serde_json::to_vec(message).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize channel message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize a channel message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<ChannelMessage> {
        let message: ChannelMessage =
            serde_json::from_slice(bytes).map_err(|e| MatchmakingError::InvalidMessage {
                reason: format!("Failed to deserialize channel message: {}", e),
            })?;

        Self::validate(&message)?;
        Ok(message)
    }

    /// Validate a channel message
    pub fn validate(message: &ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::Presence { peer_id, .. } | ChannelMessage::Leave { peer_id } => {
                if peer_id.is_empty() {
                    return Err(MatchmakingError::InvalidMessage {
                        reason: "Peer ID cannot be empty".to_string(),
                    }
                    .into());
                }
            }
            ChannelMessage::MatchPropose { from_id, target_id }
            | ChannelMessage::MatchAccept { from_id, target_id } => {
                if from_id.is_empty() || target_id.is_empty() {
                    return Err(MatchmakingError::InvalidMessage {
                        reason: "Sender and target IDs cannot be empty".to_string(),
                    }
                    .into());
                }
                if from_id == target_id {
                    return Err(MatchmakingError::InvalidMessage {
                        reason: format!("Peer {} cannot address itself", from_id),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }
}
