//! In-process session transport
//!
//! Peers living in the same process reach each other through a shared hub.
//! Every `open` becomes a `SessionRequest` on the target's endpoint and waits
//! until the target answers or rejects it.

use crate::error::{MatchmakingError, Result};
use crate::session::media::LocalMedia;
use crate::session::transport::{
    Link, LinkControl, LinkEvent, LinkKind, SessionRequest, SessionTransport,
};
use crate::types::{PeerId, RemoteStream};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// How long an outgoing link waits for the remote side to answer
const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

struct Registration {
    id: u64,
    requests: mpsc::UnboundedSender<SessionRequest>,
}

struct PendingLink {
    from: PeerId,
    to: PeerId,
    stream_id: String,
    reply: oneshot::Sender<Result<Link>>,
}

#[derive(Default)]
struct SessionHubInner {
    endpoints: Mutex<HashMap<PeerId, Registration>>,
    pending: Mutex<HashMap<u64, PendingLink>>,
    next_id: AtomicU64,
}

impl SessionHubInner {
    fn take_pending(&self, id: u64) -> Result<Option<PendingLink>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire pending sessions lock".to_string(),
            })?;
        Ok(pending.remove(&id))
    }
}

/// Registry of in-process session endpoints
#[derive(Clone, Default)]
pub struct LocalSessionHub {
    inner: Arc<SessionHubInner>,
}

impl LocalSessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id`, returning its transport and its inbound request stream
    pub fn endpoint(
        &self,
        peer_id: &str,
    ) -> Result<(LocalSessionEndpoint, mpsc::UnboundedReceiver<SessionRequest>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .endpoints
            .lock()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire session endpoints lock".to_string(),
            })?
            .insert(peer_id.to_string(), Registration { id, requests: tx });

        let endpoint = LocalSessionEndpoint {
            hub: self.inner.clone(),
            peer_id: peer_id.to_string(),
            registration: id,
        };
        Ok((endpoint, rx))
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .map(|endpoints| endpoints.len())
            .unwrap_or(0)
    }
}

/// One peer's view of the session hub
pub struct LocalSessionEndpoint {
    hub: Arc<SessionHubInner>,
    peer_id: PeerId,
    registration: u64,
}

impl Drop for LocalSessionEndpoint {
    fn drop(&mut self) {
        if let Ok(mut endpoints) = self.hub.endpoints.lock() {
            if endpoints
                .get(&self.peer_id)
                .map(|r| r.id == self.registration)
                .unwrap_or(false)
            {
                endpoints.remove(&self.peer_id);
            }
        }
    }
}

#[async_trait]
impl SessionTransport for LocalSessionEndpoint {
    async fn open(&self, peer_id: &PeerId, kind: LinkKind, media: &LocalMedia) -> Result<Link> {
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending =
                self.hub
                    .pending
                    .lock()
                    .map_err(|_| MatchmakingError::InternalError {
                        message: "Failed to acquire pending sessions lock".to_string(),
                    })?;
            pending.insert(
                id,
                PendingLink {
                    from: self.peer_id.clone(),
                    to: peer_id.clone(),
                    stream_id: media.stream_id.clone(),
                    reply: reply_tx,
                },
            );
        }

        let request = SessionRequest {
            id,
            peer_id: self.peer_id.clone(),
            kind,
        };
        let delivered = self
            .hub
            .endpoints
            .lock()
            .map(|endpoints| {
                endpoints
                    .get(peer_id)
                    .map(|r| r.requests.send(request).is_ok())
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        if !delivered {
            self.hub.take_pending(id)?;
            return Err(MatchmakingError::PeerUnreachable {
                peer_id: peer_id.clone(),
            }
            .into());
        }

        debug!("Waiting for {} to answer {:?} link {}", peer_id, kind, id);
        match tokio::time::timeout(ANSWER_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MatchmakingError::SessionRejected {
                peer_id: peer_id.clone(),
            }
            .into()),
            Err(_) => {
                self.hub.take_pending(id)?;
                Err(MatchmakingError::SessionFailed {
                    reason: format!("{} did not answer within {:?}", peer_id, ANSWER_TIMEOUT),
                }
                .into())
            }
        }
    }

    async fn answer(&self, request: &SessionRequest, media: &LocalMedia) -> Result<Link> {
        let pending = self
            .hub
            .take_pending(request.id)?
            .filter(|p| p.to == self.peer_id && p.from == request.peer_id)
            .ok_or_else(|| MatchmakingError::SessionFailed {
                reason: format!("Session request {} is no longer pending", request.id),
            })?;

        let (initiator_tx, initiator_rx) = mpsc::unbounded_channel();
        let (responder_tx, responder_rx) = mpsc::unbounded_channel();

        for (tx, remote_peer, remote_stream) in [
            (&initiator_tx, &self.peer_id, &media.stream_id),
            (&responder_tx, &pending.from, &pending.stream_id),
        ] {
            let _ = tx.send(LinkEvent::Open);
            if request.kind == LinkKind::Media {
                let _ = tx.send(LinkEvent::RemoteStream(RemoteStream {
                    peer_id: remote_peer.clone(),
                    stream_id: remote_stream.clone(),
                }));
            }
        }

        let initiator_link = Link {
            kind: request.kind,
            events: initiator_rx,
            control: Box::new(LocalLinkControl::new(responder_tx.clone())),
        };
        let responder_link = Link {
            kind: request.kind,
            events: responder_rx,
            control: Box::new(LocalLinkControl::new(initiator_tx)),
        };

        pending.reply.send(Ok(initiator_link)).map_err(|_| {
            MatchmakingError::SessionFailed {
                reason: format!("{} stopped waiting for the answer", request.peer_id),
            }
        })?;

        Ok(responder_link)
    }

    async fn reject(&self, request: &SessionRequest) {
        if let Ok(Some(pending)) = self.hub.take_pending(request.id) {
            let _ = pending.reply.send(Err(MatchmakingError::SessionRejected {
                peer_id: self.peer_id.clone(),
            }
            .into()));
        }
    }
}

/// Delivers outbound traffic straight into the remote link's event stream
struct LocalLinkControl {
    remote: mpsc::UnboundedSender<LinkEvent>,
    closed: AtomicBool,
}

impl LocalLinkControl {
    fn new(remote: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            remote,
            closed: AtomicBool::new(false),
        }
    }

    fn shut(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.remote.send(LinkEvent::Closed);
        }
    }
}

#[async_trait]
impl LinkControl for LocalLinkControl {
    async fn send(&self, payload: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MatchmakingError::SessionNotActive.into());
        }
        self.remote
            .send(LinkEvent::Message(payload))
            .map_err(|_| MatchmakingError::SessionNotActive.into())
    }

    async fn close(&self) {
        self.shut();
    }
}

impl Drop for LocalLinkControl {
    fn drop(&mut self) {
        self.shut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::media::StaticTracks;

    fn media(id: &str) -> LocalMedia {
        LocalMedia::new(id, Arc::new(StaticTracks::default()))
    }

    #[tokio::test]
    async fn test_open_and_answer_media_link() {
        let hub = LocalSessionHub::new();
        let (alice, _alice_requests) = hub.endpoint("alice").unwrap();
        let (bob, mut bob_requests) = hub.endpoint("bob").unwrap();

        let opener = tokio::spawn(async move {
            let link = alice
                .open(&"bob".to_string(), LinkKind::Media, &media("alice-cam"))
                .await;
            (alice, link)
        });

        let request = bob_requests.recv().await.unwrap();
        assert_eq!(request.peer_id, "alice");
        assert_eq!(request.kind, LinkKind::Media);

        let mut bob_link = bob.answer(&request, &media("bob-cam")).await.unwrap();
        let (_alice, alice_link) = opener.await.unwrap();
        let mut alice_link = alice_link.unwrap();

        assert_eq!(alice_link.events.recv().await, Some(LinkEvent::Open));
        assert_eq!(
            alice_link.events.recv().await,
            Some(LinkEvent::RemoteStream(RemoteStream {
                peer_id: "bob".to_string(),
                stream_id: "bob-cam".to_string()
            }))
        );
        assert_eq!(bob_link.events.recv().await, Some(LinkEvent::Open));
        assert_eq!(
            bob_link.events.recv().await,
            Some(LinkEvent::RemoteStream(RemoteStream {
                peer_id: "alice".to_string(),
                stream_id: "alice-cam".to_string()
            }))
        );

        alice_link.control.send("hi".to_string()).await.unwrap();
        assert_eq!(
            bob_link.events.recv().await,
            Some(LinkEvent::Message("hi".to_string()))
        );

        bob_link.control.close().await;
        assert_eq!(alice_link.events.recv().await, Some(LinkEvent::Closed));
        assert!(bob_link.control.send("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_reject_fails_opener() {
        let hub = LocalSessionHub::new();
        let (alice, _alice_requests) = hub.endpoint("alice").unwrap();
        let (bob, mut bob_requests) = hub.endpoint("bob").unwrap();

        let opener = tokio::spawn(async move {
            alice
                .open(&"bob".to_string(), LinkKind::Data, &media("a"))
                .await
                .map(|_| ())
        });

        let request = bob_requests.recv().await.unwrap();
        bob.reject(&request).await;

        let err = opener.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert!(bob.answer(&request, &media("b")).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_peer_unreachable() {
        let hub = LocalSessionHub::new();
        let (alice, _requests) = hub.endpoint("alice").unwrap();
        let err = alice
            .open(&"nobody".to_string(), LinkKind::Data, &media("a"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_dropped_endpoint_unregisters() {
        let hub = LocalSessionHub::new();
        let (alice, _requests) = hub.endpoint("alice").unwrap();
        assert_eq!(hub.endpoint_count(), 1);
        drop(alice);
        assert_eq!(hub.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_link_notifies_remote() {
        let hub = LocalSessionHub::new();
        let (alice, _alice_requests) = hub.endpoint("alice").unwrap();
        let (bob, mut bob_requests) = hub.endpoint("bob").unwrap();

        let opener = tokio::spawn(async move {
            alice
                .open(&"bob".to_string(), LinkKind::Data, &media("a"))
                .await
        });
        let request = bob_requests.recv().await.unwrap();
        let bob_link = bob.answer(&request, &media("b")).await.unwrap();
        let mut alice_link = opener.await.unwrap().unwrap();

        drop(bob_link);
        assert_eq!(alice_link.events.recv().await, Some(LinkEvent::Open));
        assert_eq!(alice_link.events.recv().await, Some(LinkEvent::Closed));
    }
}
