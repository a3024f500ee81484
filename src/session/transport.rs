//! Point-to-point session transport seam
//!
//! A session is made of one media link and one reliable data link. How those
//! links are actually carried (codecs, ICE, relays) is the transport's
//! business; the handoff only sees the events below.

use crate::error::Result;
use crate::session::media::LocalMedia;
use crate::types::{PeerId, RemoteStream};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Which half of a session a link carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Media,
    Data,
}

/// Events raised by one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link is usable
    Open,
    /// The remote stream arrived on a media link
    RemoteStream(RemoteStream),
    /// Application payload on a data link
    Message(String),
    Closed,
    Error(String),
}

/// Outbound side of a link
#[async_trait]
pub trait LinkControl: Send + Sync {
    async fn send(&self, payload: String) -> Result<()>;
    async fn close(&self);
}

/// One established link to a peer
pub struct Link {
    pub kind: LinkKind,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    pub control: Box<dyn LinkControl>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("kind", &self.kind).finish()
    }
}

/// Inbound attempt by a remote peer to attach a link to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub id: u64,
    pub peer_id: PeerId,
    pub kind: LinkKind,
}

/// Opens, answers, and refuses links
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Open a link to `peer_id`; media links carry the local stream
    async fn open(&self, peer_id: &PeerId, kind: LinkKind, media: &LocalMedia) -> Result<Link>;

    /// Complete an inbound request
    async fn answer(&self, request: &SessionRequest, media: &LocalMedia) -> Result<Link>;

    /// Refuse an inbound request; the requester sees the link fail
    async fn reject(&self, request: &SessionRequest);
}
