//! Pairing engine task
//!
//! One engine per local peer. A single tokio task owns the state machine, the
//! broadcast client, the timers, and the live session, and feeds every input
//! through `Matchmaker::handle` in arrival order. The outside world talks to
//! it through a cloneable `EngineHandle`.

use crate::channel::client::{BroadcastClient, ClientEvent, ReconnectPolicy};
use crate::channel::transport::BroadcastTransport;
use crate::config::AppConfig;
use crate::error::{MatchmakingError, Result};
use crate::matchmaking::machine::{MatchAction, MatchEvent, Matchmaker, TimerKind};
use crate::matchmaking::MatchTimings;
use crate::metrics::MetricsCollector;
use crate::session::handoff::{SessionEvent, SessionHandle, SessionHandoff, SessionUpdate};
use crate::session::media::{LocalMedia, MediaSource};
use crate::session::transport::{SessionRequest, SessionTransport};
use crate::types::{
    AttemptId, LeaveReason, MatchState, MatchStatus, PeerId, Region, RemoteStream, SessionRole,
};
use crate::utils::short_id;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 64;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timings: MatchTimings,
    pub reconnect: ReconnectPolicy,
    /// Presence heartbeat while matching
    pub presence_interval: Duration,
    pub sweep_interval: Duration,
    /// Upper bound on closing the broadcast channel at stop
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timings: MatchTimings::default(),
            reconnect: ReconnectPolicy::default(),
            presence_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timings: config.match_timings(),
            reconnect: config.reconnect_policy(),
            presence_interval: config.presence_interval(),
            sweep_interval: config.blacklist_sweep_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Collaborators an engine is built from
pub struct EngineDeps {
    pub peer_id: PeerId,
    pub broadcast: Arc<dyn BroadcastTransport>,
    pub sessions: Arc<dyn SessionTransport>,
    /// Inbound session requests addressed to `peer_id`
    pub session_requests: mpsc::UnboundedReceiver<SessionRequest>,
    pub metrics: Arc<MetricsCollector>,
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    PartnerConnected {
        peer_id: PeerId,
        role: SessionRole,
        stream: Option<RemoteStream>,
    },
    AppMessage {
        peer_id: PeerId,
        payload: String,
    },
    PartnerLeft {
        peer_id: PeerId,
        reason: LeaveReason,
    },
}

enum EngineCommand {
    Start {
        region: Region,
        media_source: Arc<dyn MediaSource>,
        reply: oneshot::Sender<Result<()>>,
    },
    Skip {
        blacklist: bool,
    },
    SendAppMessage {
        payload: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleAudio {
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable control surface of a running engine
#[derive(Clone)]
pub struct EngineHandle {
    peer_id: PeerId,
    commands: mpsc::UnboundedSender<EngineCommand>,
    status: watch::Receiver<MatchStatus>,
    notifications: broadcast::Sender<EngineNotification>,
}

impl EngineHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Acquire local media and join `region`
    pub async fn start(&self, region: Region, media_source: Arc<dyn MediaSource>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::Start {
            region,
            media_source,
            reply,
        })?;
        rx.await.map_err(|_| MatchmakingError::EngineStopped)?
    }

    /// Leave the current partner (if any) and look for the next one
    pub fn skip(&self, blacklist: bool) -> Result<()> {
        self.command(EngineCommand::Skip { blacklist })
    }

    /// Send a payload to the connected partner over the data link
    pub async fn send_app_message(&self, payload: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::SendAppMessage {
            payload: payload.into(),
            reply,
        })?;
        rx.await.map_err(|_| MatchmakingError::EngineStopped)?
    }

    /// Flip the local audio track; returns whether it is now enabled
    pub async fn toggle_audio(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::ToggleAudio { reply })?;
        rx.await.map_err(|_| MatchmakingError::EngineStopped)?
    }

    /// Flip the local video track; returns whether it is now enabled
    pub async fn toggle_video(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::ToggleVideo { reply })?;
        rx.await.map_err(|_| MatchmakingError::EngineStopped)?
    }

    /// Tear everything down and leave the channel; the engine cannot be restarted
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.command(EngineCommand::Stop { reply }).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn status(&self) -> MatchStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<MatchStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.notifications.subscribe()
    }

    /// Wait until the status satisfies `predicate`
    pub async fn wait_for_status<F>(&self, predicate: F) -> Result<MatchStatus>
    where
        F: Fn(MatchStatus) -> bool,
    {
        let mut status = self.status.clone();
        let found = status
            .wait_for(|current| predicate(*current))
            .await
            .map_err(|_| MatchmakingError::EngineStopped)?;
        Ok(*found)
    }

    fn command(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| MatchmakingError::EngineStopped.into())
    }
}

/// Entry point for spawning engines
pub struct MatchEngine;

impl MatchEngine {
    /// Spawn the engine task for one local peer
    pub fn spawn(config: EngineConfig, deps: EngineDeps) -> EngineHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(MatchStatus::Idle);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let handle = EngineHandle {
            peer_id: deps.peer_id.clone(),
            commands: commands_tx,
            status: status_rx,
            notifications: notifications.clone(),
        };

        let core = EngineCore {
            machine: Matchmaker::new(deps.peer_id.clone(), config.timings),
            peer_id: deps.peer_id,
            config,
            broadcast: deps.broadcast,
            handoff: SessionHandoff::new(deps.sessions, session_tx),
            metrics: deps.metrics,
            client: None,
            client_tx,
            media: None,
            session: None,
            last_stream: None,
            timers: HashMap::new(),
            timer_tx,
            pending_requests: HashMap::new(),
            status: status_tx,
            notifications,
            reported_blacklist: 0,
        };

        tokio::spawn(core.run(EngineInputs {
            commands: commands_rx,
            client: client_rx,
            session_requests: deps.session_requests,
            timers: timer_rx,
            sessions: session_rx,
        }));

        handle
    }
}

struct EngineInputs {
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    client: mpsc::UnboundedReceiver<ClientEvent>,
    session_requests: mpsc::UnboundedReceiver<SessionRequest>,
    timers: mpsc::UnboundedReceiver<(AttemptId, TimerKind)>,
    sessions: mpsc::UnboundedReceiver<SessionUpdate>,
}

struct EngineCore {
    machine: Matchmaker,
    peer_id: PeerId,
    config: EngineConfig,
    broadcast: Arc<dyn BroadcastTransport>,
    handoff: SessionHandoff,
    metrics: Arc<MetricsCollector>,
    client: Option<BroadcastClient>,
    client_tx: mpsc::UnboundedSender<ClientEvent>,
    media: Option<LocalMedia>,
    session: Option<SessionHandle>,
    /// Remote stream of the session being established
    last_stream: Option<RemoteStream>,
    timers: HashMap<AttemptId, Vec<JoinHandle<()>>>,
    timer_tx: mpsc::UnboundedSender<(AttemptId, TimerKind)>,
    pending_requests: HashMap<u64, SessionRequest>,
    status: watch::Sender<MatchStatus>,
    notifications: broadcast::Sender<EngineNotification>,
    reported_blacklist: i64,
}

impl EngineCore {
    async fn run(mut self, mut inputs: EngineInputs) {
        let mut presence =
            interval_at(Instant::now() + self.config.presence_interval, self.config.presence_interval);
        presence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep =
            interval_at(Instant::now() + self.config.sweep_interval, self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Pairing engine {} ready", short_id(&self.peer_id));

        loop {
            tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(command) => {
                        if self.on_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("Every handle to engine {} dropped", short_id(&self.peer_id));
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = inputs.client.recv() => self.on_client_event(event),
                Some(request) = inputs.session_requests.recv() => self.on_session_request(request),
                Some((attempt, kind)) = inputs.timers.recv() => {
                    self.dispatch(MatchEvent::TimerFired { attempt, kind });
                }
                Some(update) = inputs.sessions.recv() => self.on_session_update(update),
                _ = presence.tick() => self.dispatch(MatchEvent::PresenceTick),
                _ = sweep.tick() => self.dispatch(MatchEvent::SweepTick),
            }
        }

        info!("Pairing engine {} stopped", short_id(&self.peer_id));
    }

    /// Breaks once the engine has shut down
    async fn on_command(&mut self, command: EngineCommand) -> ControlFlow<()> {
        match command {
            EngineCommand::Start {
                region,
                media_source,
                reply,
            } => {
                let result = self.start(region, media_source).await;
                let _ = reply.send(result);
            }
            EngineCommand::Skip { blacklist } => {
                info!(
                    "Skip requested - peer: {}, blacklist: {}",
                    short_id(&self.peer_id),
                    blacklist
                );
                self.dispatch(MatchEvent::Skip { blacklist });
            }
            EngineCommand::SendAppMessage { payload, reply } => {
                let _ = reply.send(self.send_app_message(payload));
            }
            EngineCommand::ToggleAudio { reply } => {
                let _ = reply.send(self.local_media().map(|media| media.toggle_audio()));
            }
            EngineCommand::ToggleVideo { reply } => {
                let _ = reply.send(self.local_media().map(|media| media.toggle_video()));
            }
            EngineCommand::Stop { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start(&mut self, region: Region, media_source: Arc<dyn MediaSource>) -> Result<()> {
        if self.machine.state() != &MatchState::Idle || self.media.is_some() {
            return Err(MatchmakingError::InternalError {
                message: "Engine already started".to_string(),
            }
            .into());
        }

        self.dispatch(MatchEvent::MediaRequested);
        let media = match media_source.acquire().await {
            Ok(media) => media,
            Err(e) => {
                error!("Failed to acquire local media: {}", e);
                self.dispatch(MatchEvent::MediaFailed {
                    reason: e.to_string(),
                });
                return Err(MatchmakingError::MediaUnavailable {
                    reason: e.to_string(),
                }
                .into());
            }
        };

        info!(
            "Starting pairing - peer: {}, region: {}, stream: {}",
            short_id(&self.peer_id),
            region,
            media.stream_id
        );
        self.media = Some(media);
        self.client = Some(BroadcastClient::connect(
            self.broadcast.clone(),
            region,
            self.peer_id.clone(),
            self.config.reconnect,
            self.client_tx.clone(),
            self.metrics.clone(),
        ));
        self.dispatch(MatchEvent::MediaReady);
        Ok(())
    }

    fn send_app_message(&self, payload: String) -> Result<()> {
        match (self.machine.state(), &self.session) {
            (MatchState::Connected { .. }, Some(session)) => session.send(payload),
            _ => Err(MatchmakingError::SessionNotActive.into()),
        }
    }

    fn local_media(&self) -> Result<&LocalMedia> {
        self.media.as_ref().ok_or_else(|| {
            MatchmakingError::MediaUnavailable {
                reason: "engine has not been started".to_string(),
            }
            .into()
        })
    }

    fn on_client_event(&mut self, event: ClientEvent) {
        let event = match event {
            ClientEvent::Online { reconnected } => MatchEvent::ChannelOnline { reconnected },
            ClientEvent::Offline => MatchEvent::ChannelOffline,
            ClientEvent::Message(message) => MatchEvent::Message(message),
            ClientEvent::MemberLeft(peer_id) => MatchEvent::MemberLeft(peer_id),
        };
        self.dispatch(event);
    }

    fn on_session_request(&mut self, request: SessionRequest) {
        debug!(
            "Session request {} from {} for {:?} link",
            request.id,
            short_id(&request.peer_id),
            request.kind
        );
        let event = MatchEvent::SessionRequested {
            peer_id: request.peer_id.clone(),
            request_id: request.id,
        };
        self.pending_requests.insert(request.id, request);
        self.dispatch(event);
    }

    fn on_session_update(&mut self, update: SessionUpdate) {
        let attempt = update.attempt;
        match update.event {
            SessionEvent::Established(stream) => {
                if attempt == self.machine.attempt() {
                    self.last_stream = Some(stream);
                }
                self.dispatch(MatchEvent::SessionEstablished { attempt });
            }
            SessionEvent::Data(payload) => {
                if let (MatchState::Connected { peer_id, .. }, true) = (
                    self.machine.state(),
                    attempt == self.machine.attempt(),
                ) {
                    let _ = self.notifications.send(EngineNotification::AppMessage {
                        peer_id: peer_id.clone(),
                        payload,
                    });
                }
            }
            SessionEvent::Closed => self.dispatch(MatchEvent::SessionClosed { attempt }),
            SessionEvent::Failed(reason) => {
                self.dispatch(MatchEvent::SessionFailed { attempt, reason })
            }
        }
    }

    /// Run one event through the state machine and carry out its actions
    fn dispatch(&mut self, event: MatchEvent) {
        let actions = self.machine.handle(event, Instant::now());
        for action in actions {
            self.execute(action);
        }

        let size = self.machine.blacklist_len() as i64;
        self.metrics
            .adjust_blacklist_size(size - self.reported_blacklist);
        self.reported_blacklist = size;
    }

    fn execute(&mut self, action: MatchAction) {
        match action {
            MatchAction::Broadcast(message) => match &self.client {
                Some(client) => {
                    if let Err(e) = client.send(message) {
                        debug!("Broadcast client unavailable: {}", e);
                    }
                }
                None => debug!("No broadcast client, dropping {}", message.msg_type()),
            },
            MatchAction::Schedule {
                attempt,
                kind,
                after,
            } => self.schedule(attempt, kind, after),
            MatchAction::CancelTimers { attempt } => {
                if let Some(handles) = self.timers.remove(&attempt) {
                    for handle in handles {
                        handle.abort();
                    }
                }
            }
            MatchAction::InitiateSession { peer_id, attempt } => match &self.media {
                Some(media) => {
                    self.last_stream = None;
                    self.session = Some(self.handoff.initiate(&peer_id, media.clone(), attempt));
                }
                None => warn!("Cannot initiate a session without local media"),
            },
            MatchAction::AnswerSession {
                request_id,
                peer_id,
                attempt,
            } => self.answer_session(request_id, peer_id, attempt),
            MatchAction::RejectSession {
                request_id,
                peer_id,
            } => {
                self.metrics.record_session_rejected();
                if let Some(request) = self.pending_requests.remove(&request_id) {
                    warn!("Rejected session request from {}", short_id(&peer_id));
                    self.reject_later(request);
                }
            }
            MatchAction::TearDownSession { attempt } => {
                if self
                    .session
                    .as_ref()
                    .map(|session| session.attempt() == attempt)
                    .unwrap_or(false)
                {
                    if let Some(session) = self.session.take() {
                        session.close();
                    }
                }
                self.last_stream = None;
            }
            MatchAction::StatusChanged(status) => {
                info!("Status for {} is now {}", short_id(&self.peer_id), status);
                self.status.send_replace(status);
            }
            MatchAction::PartnerConnected {
                peer_id,
                role,
                waited,
            } => {
                self.metrics.record_match(role, waited);
                let _ = self
                    .notifications
                    .send(EngineNotification::PartnerConnected {
                        peer_id,
                        role,
                        stream: self.last_stream.clone(),
                    });
            }
            MatchAction::PartnerReleased {
                peer_id,
                reason,
                was_connected,
            } => {
                self.metrics.record_partner_released(&reason, was_connected);
                if was_connected {
                    let _ = self
                        .notifications
                        .send(EngineNotification::PartnerLeft { peer_id, reason });
                }
            }
        }
    }

    fn answer_session(&mut self, request_id: u64, peer_id: PeerId, attempt: AttemptId) {
        let Some(request) = self.pending_requests.remove(&request_id) else {
            warn!("Session request {} is no longer pending", request_id);
            return;
        };

        let reuse = self
            .session
            .as_ref()
            .map(|session| session.attempt() == attempt && session.peer_id() == &peer_id)
            .unwrap_or(false);

        if !reuse {
            let Some(media) = self.media.clone() else {
                warn!("Cannot answer a session without local media");
                self.reject_later(request);
                return;
            };
            self.last_stream = None;
            if let Some(old) = self.session.replace(self.handoff.accept(&peer_id, media, attempt)) {
                old.close();
            }
        }

        if let Some(session) = &self.session {
            if let Err(e) = session.attach(request) {
                warn!("Failed to attach session request: {}", e);
            }
        }
    }

    fn reject_later(&self, request: SessionRequest) {
        let handoff = self.handoff.clone();
        tokio::spawn(async move {
            handoff.reject(&request).await;
        });
    }

    fn schedule(&mut self, attempt: AttemptId, kind: TimerKind, after: Duration) {
        let tx = self.timer_tx.clone();
        let handle = tokio::spawn(async move {
            if kind.is_repeating() {
                let mut ticks = interval_at(Instant::now() + after, after);
                loop {
                    ticks.tick().await;
                    if tx.send((attempt, kind)).is_err() {
                        return;
                    }
                }
            } else {
                tokio::time::sleep(after).await;
                let _ = tx.send((attempt, kind));
            }
        });
        self.timers.entry(attempt).or_default().push(handle);
    }

    async fn shutdown(&mut self) {
        self.dispatch(MatchEvent::Stop);

        for (_, handles) in self.timers.drain() {
            for handle in handles {
                handle.abort();
            }
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        for (_, request) in self.pending_requests.drain() {
            self.handoff.reject(&request).await;
        }
        if let Some(client) = self.client.take() {
            client.shutdown(self.config.shutdown_timeout).await;
        }
        self.metrics.adjust_blacklist_size(-self.reported_blacklist);
        self.reported_blacklist = 0;
    }
}
