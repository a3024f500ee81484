//! Publish/subscribe transport abstraction beneath the broadcast client

use crate::error::Result;
use crate::types::{PeerId, Region};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Raw inbound traffic from one transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// Payload published by some member of the region
    Payload(Vec<u8>),
    /// Transport-level notice that a member disconnected
    MemberLeft(PeerId),
    /// The connection went away underneath us
    Dropped(String),
}

/// Outbound half of one transport connection
#[async_trait]
pub trait BroadcastLink: Send + Sync {
    /// Publish a payload to every member of the region
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Tear the connection down on purpose
    async fn close(&self) -> Result<()>;
}

/// One live connection to a region topic
pub struct TransportConnection {
    pub link: Box<dyn BroadcastLink>,
    /// Inbound frames; the stream ending means the connection dropped
    pub inbound: mpsc::Receiver<TransportFrame>,
}

/// Factory for region connections
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Open one connection to the region topic on behalf of `peer_id`
    async fn connect(&self, region: Region, peer_id: &PeerId) -> Result<TransportConnection>;
}
