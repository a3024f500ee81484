//! Turns a completed handshake into a live session
//!
//! A session handle owns a media link and a data link. It reports
//! `Established` once the remote stream has arrived and the data link is
//! open; closing or failing either link takes the whole session down. Every
//! event is tagged with the attempt that created the handle, so the state
//! machine can drop leftovers from an abandoned attempt.

use crate::error::{MatchmakingError, Result};
use crate::session::media::LocalMedia;
use crate::session::transport::{Link, LinkEvent, LinkKind, SessionRequest, SessionTransport};
use crate::types::{AttemptId, PeerId, RemoteStream, SessionRole};
use crate::utils::short_id;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What a session reports back to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established(RemoteStream),
    Data(String),
    Closed,
    Failed(String),
}

/// A session event tagged with its attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub attempt: AttemptId,
    pub event: SessionEvent,
}

enum HandleCommand {
    Attach(SessionRequest),
    Send(String),
    Close,
}

/// Starts sessions on top of a session transport
#[derive(Clone)]
pub struct SessionHandoff {
    transport: Arc<dyn SessionTransport>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl SessionHandoff {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Self {
        Self { transport, updates }
    }

    /// Open both links towards `peer_id`; we proposed, so we call
    pub fn initiate(&self, peer_id: &str, media: LocalMedia, attempt: AttemptId) -> SessionHandle {
        info!(
            "Initiating session - partner: {}, attempt: {}",
            short_id(peer_id),
            attempt
        );
        self.spawn(peer_id, media, attempt, SessionRole::Initiator)
    }

    /// Prepare to answer `peer_id`; authorized requests are attached afterwards
    pub fn accept(&self, peer_id: &str, media: LocalMedia, attempt: AttemptId) -> SessionHandle {
        info!(
            "Answering session - partner: {}, attempt: {}",
            short_id(peer_id),
            attempt
        );
        self.spawn(peer_id, media, attempt, SessionRole::Responder)
    }

    /// Refuse an inbound request outright
    pub async fn reject(&self, request: &SessionRequest) {
        self.transport.reject(request).await;
    }

    fn spawn(
        &self,
        peer_id: &str,
        media: LocalMedia,
        attempt: AttemptId,
        role: SessionRole,
    ) -> SessionHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            transport: self.transport.clone(),
            peer_id: peer_id.to_string(),
            media,
            attempt,
            updates: self.updates.clone(),
            commands: command_rx,
        };
        match role {
            SessionRole::Initiator => tokio::spawn(task.run_initiator()),
            SessionRole::Responder => tokio::spawn(task.run_responder()),
        };

        SessionHandle {
            peer_id: peer_id.to_string(),
            attempt,
            role,
            commands,
            transport: self.transport.clone(),
        }
    }
}

/// Live session with one partner
pub struct SessionHandle {
    peer_id: PeerId,
    attempt: AttemptId,
    role: SessionRole,
    commands: mpsc::UnboundedSender<HandleCommand>,
    transport: Arc<dyn SessionTransport>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer_id", &self.peer_id)
            .field("attempt", &self.attempt)
            .field("role", &self.role)
            .finish()
    }
}

impl std::fmt::Debug for HandleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleCommand::Attach(request) => write!(f, "Attach({})", request.id),
            HandleCommand::Send(_) => write!(f, "Send"),
            HandleCommand::Close => write!(f, "Close"),
        }
    }
}

impl SessionHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Hand an authorized inbound request to a responder session
    ///
    /// A finished session refuses the request so the opener is not left waiting.
    pub fn attach(&self, request: SessionRequest) -> Result<()> {
        let Err(mpsc::error::SendError(command)) = self.commands.send(HandleCommand::Attach(request))
        else {
            return Ok(());
        };
        if let HandleCommand::Attach(request) = command {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                transport.reject(&request).await;
            });
        }
        Err(MatchmakingError::SessionNotActive.into())
    }

    /// Send an application payload over the data link
    pub fn send(&self, payload: String) -> Result<()> {
        self.commands
            .send(HandleCommand::Send(payload))
            .map_err(|_| MatchmakingError::SessionNotActive.into())
    }

    /// Close both links; no event is reported for a local close
    pub fn close(&self) {
        let _ = self.commands.send(HandleCommand::Close);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionTask {
    transport: Arc<dyn SessionTransport>,
    peer_id: PeerId,
    media: LocalMedia,
    attempt: AttemptId,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    commands: mpsc::UnboundedReceiver<HandleCommand>,
}

/// Links collected so far, plus what they already reported
#[derive(Default)]
struct Gathering {
    media: Option<Link>,
    data: Option<Link>,
    remote_stream: Option<RemoteStream>,
    data_open: bool,
}

impl Gathering {
    /// Store a link, returning the one it displaced
    fn place(&mut self, link: Link) -> Option<Link> {
        match link.kind {
            LinkKind::Media => self.media.replace(link),
            LinkKind::Data => self.data.replace(link),
        }
    }

    fn is_complete(&self) -> bool {
        self.media.is_some() && self.data.is_some()
    }

    /// Next event from whichever links are already up; pends while there are none
    async fn next_event(&mut self) -> (LinkKind, Option<LinkEvent>) {
        tokio::select! {
            event = link_event(&mut self.media) => (LinkKind::Media, event),
            event = link_event(&mut self.data) => (LinkKind::Data, event),
        }
    }

    async fn close_all(&mut self) {
        for link in [self.media.take(), self.data.take()].into_iter().flatten() {
            link.control.close().await;
        }
    }
}

async fn link_event(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

enum Gathered {
    Links(Gathering),
    Failed(String),
    RemoteClosed,
    Closed,
}

enum Step {
    Opened(LinkKind, Result<Link>),
    Command(Option<HandleCommand>),
    Event(LinkKind, Option<LinkEvent>),
}

impl SessionTask {
    fn emit(&self, event: SessionEvent) {
        let _ = self.updates.send(SessionUpdate {
            attempt: self.attempt,
            event,
        });
    }

    /// Record an event from a link that is up while its sibling is not
    fn observe(
        &self,
        gathering: &mut Gathering,
        kind: LinkKind,
        event: Option<LinkEvent>,
    ) -> Option<Gathered> {
        match event {
            Some(LinkEvent::Open) => {
                if kind == LinkKind::Data {
                    gathering.data_open = true;
                }
                None
            }
            Some(LinkEvent::RemoteStream(stream)) => {
                gathering.remote_stream = Some(stream);
                None
            }
            Some(LinkEvent::Message(payload)) => {
                self.emit(SessionEvent::Data(payload));
                None
            }
            Some(LinkEvent::Closed) | None => {
                debug!(
                    "{:?} link to {} closed before the session was up",
                    kind,
                    short_id(&self.peer_id)
                );
                Some(Gathered::RemoteClosed)
            }
            Some(LinkEvent::Error(e)) => Some(Gathered::Failed(e)),
        }
    }

    async fn run_initiator(mut self) {
        let transport = self.transport.clone();
        let peer_id = self.peer_id.clone();
        let media = self.media.clone();
        let media_open = transport.open(&peer_id, LinkKind::Media, &media);
        let data_open = transport.open(&peer_id, LinkKind::Data, &media);
        tokio::pin!(media_open);
        tokio::pin!(data_open);

        let mut gathering = Gathering::default();
        let mut media_pending = true;
        let mut data_pending = true;

        let gathered = loop {
            if gathering.is_complete() {
                break Gathered::Links(std::mem::take(&mut gathering));
            }

            let step = tokio::select! {
                result = &mut media_open, if media_pending => Step::Opened(LinkKind::Media, result),
                result = &mut data_open, if data_pending => Step::Opened(LinkKind::Data, result),
                (kind, event) = gathering.next_event() => Step::Event(kind, event),
                command = self.commands.recv() => Step::Command(command),
            };

            match step {
                Step::Opened(kind, result) => {
                    match kind {
                        LinkKind::Media => media_pending = false,
                        LinkKind::Data => data_pending = false,
                    }
                    match result {
                        Ok(link) => {
                            gathering.place(link);
                        }
                        Err(e) => break Gathered::Failed(e.to_string()),
                    }
                }
                Step::Event(kind, event) => {
                    if let Some(outcome) = self.observe(&mut gathering, kind, event) {
                        break outcome;
                    }
                }
                Step::Command(Some(HandleCommand::Send(_))) => {
                    debug!("Session not established yet, dropping payload")
                }
                Step::Command(Some(HandleCommand::Attach(request))) => {
                    warn!("Initiator session cannot attach request {}", request.id);
                    self.transport.reject(&request).await;
                }
                Step::Command(Some(HandleCommand::Close)) | Step::Command(None) => {
                    break Gathered::Closed
                }
            }
        };

        gathering.close_all().await;
        self.finish_gathering(gathered).await;
    }

    async fn run_responder(mut self) {
        let mut gathering = Gathering::default();

        let gathered = loop {
            if gathering.is_complete() {
                break Gathered::Links(std::mem::take(&mut gathering));
            }

            let step = tokio::select! {
                (kind, event) = gathering.next_event() => Step::Event(kind, event),
                command = self.commands.recv() => Step::Command(command),
            };

            match step {
                Step::Event(kind, event) => {
                    if let Some(outcome) = self.observe(&mut gathering, kind, event) {
                        break outcome;
                    }
                }
                Step::Command(Some(HandleCommand::Attach(request))) => {
                    if request.peer_id != self.peer_id {
                        self.transport.reject(&request).await;
                        continue;
                    }
                    match self.transport.answer(&request, &self.media).await {
                        Ok(link) => {
                            if let Some(old) = gathering.place(link) {
                                old.control.close().await;
                            }
                        }
                        Err(e) => break Gathered::Failed(e.to_string()),
                    }
                }
                Step::Command(Some(HandleCommand::Send(_))) => {
                    debug!("Session not established yet, dropping payload")
                }
                Step::Command(Some(HandleCommand::Close)) | Step::Command(None) => {
                    break Gathered::Closed
                }
                Step::Opened(..) => {}
            }
        };

        gathering.close_all().await;
        self.finish_gathering(gathered).await;
    }

    async fn finish_gathering(self, gathered: Gathered) {
        let mut task = match gathered {
            Gathered::Links(gathering) => self.run_links(gathering).await,
            other => {
                self.report_setup_end(other);
                self
            }
        };
        task.refuse_queued().await;
    }

    fn report_setup_end(&self, gathered: Gathered) {
        match gathered {
            Gathered::Links(_) => {}
            Gathered::Failed(reason) => {
                warn!(
                    "Session setup with {} failed: {}",
                    short_id(&self.peer_id),
                    reason
                );
                self.emit(SessionEvent::Failed(reason));
            }
            Gathered::RemoteClosed => {
                info!(
                    "Session with {} closed by the partner during setup",
                    short_id(&self.peer_id)
                );
                self.emit(SessionEvent::Closed);
            }
            Gathered::Closed => debug!("Session with {} closed during setup", short_id(&self.peer_id)),
        }
    }

    /// Requests queued behind the end of the session are refused, not dropped
    async fn refuse_queued(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let HandleCommand::Attach(request) = command {
                debug!("Session finished, rejecting request {}", request.id);
                self.transport.reject(&request).await;
            }
        }
    }

    async fn run_links(mut self, gathering: Gathering) -> Self {
        let Gathering {
            media: Some(mut media_link),
            data: Some(mut data_link),
            mut remote_stream,
            mut data_open,
        } = gathering
        else {
            self.emit(SessionEvent::Failed("incomplete session links".to_string()));
            return self;
        };
        let mut established = false;

        let outcome = loop {
            if !established && data_open {
                if let Some(stream) = &remote_stream {
                    established = true;
                    info!(
                        "Session established - partner: {}, stream: {}, attempt: {}",
                        short_id(&self.peer_id),
                        stream.stream_id,
                        self.attempt
                    );
                    self.emit(SessionEvent::Established(stream.clone()));
                }
            }

            tokio::select! {
                event = media_link.events.recv() => match event {
                    Some(LinkEvent::RemoteStream(stream)) => remote_stream = Some(stream),
                    Some(LinkEvent::Open) | Some(LinkEvent::Message(_)) => {}
                    Some(LinkEvent::Closed) | None => break Some(SessionEvent::Closed),
                    Some(LinkEvent::Error(e)) => break Some(SessionEvent::Failed(e)),
                },
                event = data_link.events.recv() => match event {
                    Some(LinkEvent::Open) => data_open = true,
                    Some(LinkEvent::Message(payload)) => self.emit(SessionEvent::Data(payload)),
                    Some(LinkEvent::RemoteStream(_)) => {}
                    Some(LinkEvent::Closed) | None => break Some(SessionEvent::Closed),
                    Some(LinkEvent::Error(e)) => break Some(SessionEvent::Failed(e)),
                },
                command = self.commands.recv() => match command {
                    Some(HandleCommand::Send(payload)) => {
                        if let Err(e) = data_link.control.send(payload).await {
                            warn!("Failed to send session payload: {}", e);
                        }
                    }
                    Some(HandleCommand::Attach(request)) => {
                        debug!("Session already complete, rejecting request {}", request.id);
                        self.transport.reject(&request).await;
                    }
                    Some(HandleCommand::Close) | None => break None,
                },
            }
        };

        media_link.control.close().await;
        data_link.control.close().await;

        if let Some(event) = outcome {
            info!(
                "Session with {} ended: {:?}",
                short_id(&self.peer_id),
                event
            );
            self.emit(event);
        }
        self
    }
}
