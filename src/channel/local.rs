//! In-process region channels
//!
//! A simple in-memory hub for tests, demos, and single-process deployments.
//! Unlike AMQP it tracks membership, so a member that disconnects (closing or
//! dropping its link) produces a system leave notice for everyone else.

use crate::channel::transport::{
    BroadcastLink, BroadcastTransport, TransportConnection, TransportFrame,
};
use crate::error::{MatchmakingError, Result};
use crate::types::{PeerId, Region};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

const TOPIC_CAPACITY: usize = 256;
const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
enum HubFrame {
    Payload { from: PeerId, payload: Vec<u8> },
    Left { peer_id: PeerId },
}

struct Member {
    connection_id: u64,
    inbound: mpsc::Sender<TransportFrame>,
}

#[derive(Default)]
struct HubInner {
    topics: Mutex<HashMap<Region, broadcast::Sender<HubFrame>>>,
    members: Mutex<HashMap<(Region, PeerId), Member>>,
    next_connection: AtomicU64,
}

impl HubInner {
    fn sender_for(&self, region: Region) -> Result<broadcast::Sender<HubFrame>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire hub topics lock".to_string(),
            })?;
        Ok(topics
            .entry(region)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone())
    }

    /// Remove the member if it is still the given connection, announcing its departure
    fn depart(&self, region: Region, peer_id: &PeerId, connection_id: u64) {
        let removed = match self.members.lock() {
            Ok(mut members) => {
                let current = members
                    .get(&(region, peer_id.clone()))
                    .map(|member| member.connection_id);
                if current == Some(connection_id) {
                    members.remove(&(region, peer_id.clone()));
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        };

        if removed {
            if let Ok(sender) = self.sender_for(region) {
                let _ = sender.send(HubFrame::Left {
                    peer_id: peer_id.clone(),
                });
            }
            debug!("Local hub member {} left region {}", peer_id, region);
        }
    }
}

/// In-memory broadcast transport shared by every local peer
#[derive(Clone, Default)]
pub struct LocalBroadcastHub {
    inner: Arc<HubInner>,
}

impl LocalBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members currently connected to a region
    pub fn member_count(&self, region: Region) -> usize {
        self.inner
            .members
            .lock()
            .map(|members| members.keys().filter(|(r, _)| *r == region).count())
            .unwrap_or(0)
    }

    /// Simulate the transport dropping one member's connection
    pub fn sever(&self, region: Region, peer_id: &str) -> bool {
        let member = self
            .inner
            .members
            .lock()
            .ok()
            .and_then(|mut members| members.remove(&(region, peer_id.to_string())));

        match member {
            Some(member) => {
                let _ = member
                    .inbound
                    .try_send(TransportFrame::Dropped("severed by hub".to_string()));
                if let Ok(sender) = self.inner.sender_for(region) {
                    let _ = sender.send(HubFrame::Left {
                        peer_id: peer_id.to_string(),
                    });
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BroadcastTransport for LocalBroadcastHub {
    async fn connect(&self, region: Region, peer_id: &PeerId) -> Result<TransportConnection> {
        let sender = self.inner.sender_for(region)?;
        let mut subscription = sender.subscribe();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);

        {
            let mut members =
                self.inner
                    .members
                    .lock()
                    .map_err(|_| MatchmakingError::InternalError {
                        message: "Failed to acquire hub members lock".to_string(),
                    })?;
            members.insert(
                (region, peer_id.clone()),
                Member {
                    connection_id,
                    inbound: inbound_tx.clone(),
                },
            );
        }

        // Forward topic traffic into this member's inbound stream
        let me = peer_id.clone();
        let forward_tx = inbound_tx;
        tokio::spawn(async move {
            loop {
                let frame = match subscription.recv().await {
                    Ok(HubFrame::Payload { from, payload }) => {
                        if from == me {
                            continue;
                        }
                        TransportFrame::Payload(payload)
                    }
                    Ok(HubFrame::Left { peer_id }) => {
                        if peer_id == me {
                            continue;
                        }
                        TransportFrame::MemberLeft(peer_id)
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Local hub subscriber {} lagged by {} frames", me, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if forward_tx.send(frame).await.is_err() {
                    return;
                }
            }
        });

        let link = LocalLink {
            hub: self.inner.clone(),
            region,
            peer_id: peer_id.clone(),
            connection_id,
            sender,
        };

        Ok(TransportConnection {
            link: Box::new(link),
            inbound: inbound_rx,
        })
    }
}

struct LocalLink {
    hub: Arc<HubInner>,
    region: Region,
    peer_id: PeerId,
    connection_id: u64,
    sender: broadcast::Sender<HubFrame>,
}

impl LocalLink {
    fn is_member(&self) -> bool {
        self.hub
            .members
            .lock()
            .map(|members| {
                members
                    .get(&(self.region, self.peer_id.clone()))
                    .map(|member| member.connection_id == self.connection_id)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl BroadcastLink for LocalLink {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if !self.is_member() {
            return Err(MatchmakingError::ChannelClosed.into());
        }
        // No subscribers is not an error for a broadcast
        let _ = self.sender.send(HubFrame::Payload {
            from: self.peer_id.clone(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.hub
            .depart(self.region, &self.peer_id, self.connection_id);
        Ok(())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.hub
            .depart(self.region, &self.peer_id, self.connection_id);
    }
}
