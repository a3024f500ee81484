//! Pairing handshake state machine
//!
//! `Matchmaker` is a pure, synchronous transition function: every input is a
//! `MatchEvent`, every effect is returned as a `MatchAction` for the engine to
//! carry out. Nothing here touches the network or a clock, so each rule can be
//! tested directly.
//!
//! Glare is broken by identity: the lexicographically lower id initiates the
//! session and the higher id answers.

use crate::channel::messages::ChannelMessage;
use crate::matchmaking::lock::LockManager;
use crate::matchmaking::MatchTimings;
use crate::types::{
    AttemptId, LeaveReason, MatchState, MatchStatus, PeerId, PresenceStatus, SessionRole,
};
use crate::utils::short_id;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timers the machine asks the engine to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Re-send the proposal; repeats until cancelled
    ProposalRetry,
    /// Proposal or accepted proposal left unresolved
    HandshakeDeadline,
    /// Session handoff took too long
    NegotiationDeadline,
}

impl TimerKind {
    pub fn is_repeating(&self) -> bool {
        matches!(self, TimerKind::ProposalRetry)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    /// The application asked to start; local media is being acquired
    MediaRequested,
    /// Local media is available
    MediaReady,
    /// Local media could not be acquired
    MediaFailed { reason: String },
    /// Record received on the region channel
    Message(ChannelMessage),
    /// Transport notice that a member disconnected
    MemberLeft(PeerId),
    TimerFired { attempt: AttemptId, kind: TimerKind },
    /// A peer wants to attach a session link to us
    SessionRequested { peer_id: PeerId, request_id: u64 },
    SessionEstablished { attempt: AttemptId },
    SessionClosed { attempt: AttemptId },
    SessionFailed { attempt: AttemptId, reason: String },
    /// Local "next"; `blacklist` also avoids the current partner
    Skip { blacklist: bool },
    ChannelOffline,
    ChannelOnline { reconnected: bool },
    PresenceTick,
    SweepTick,
    Stop,
}

/// Effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchAction {
    Broadcast(ChannelMessage),
    Schedule {
        attempt: AttemptId,
        kind: TimerKind,
        after: Duration,
    },
    CancelTimers { attempt: AttemptId },
    /// Open the session towards the partner as initiator
    InitiateSession { peer_id: PeerId, attempt: AttemptId },
    /// Answer an authorized inbound session request
    AnswerSession {
        request_id: u64,
        peer_id: PeerId,
        attempt: AttemptId,
    },
    /// Refuse an inbound session request
    RejectSession { request_id: u64, peer_id: PeerId },
    TearDownSession { attempt: AttemptId },
    StatusChanged(MatchStatus),
    PartnerConnected {
        peer_id: PeerId,
        role: SessionRole,
        waited: Duration,
    },
    /// The lock on a partner was released
    PartnerReleased {
        peer_id: PeerId,
        reason: LeaveReason,
        was_connected: bool,
    },
}

/// Pairing state for one local peer
#[derive(Debug)]
pub struct Matchmaker {
    peer_id: PeerId,
    timings: MatchTimings,
    state: MatchState,
    locks: LockManager,
    attempt: AttemptId,
    /// Status reported while in `Idle`
    idle_status: MatchStatus,
    offline: bool,
    reported: MatchStatus,
    matching_since: Option<Instant>,
}

impl Matchmaker {
    pub fn new(peer_id: PeerId, timings: MatchTimings) -> Self {
        Self {
            peer_id,
            timings,
            state: MatchState::Idle,
            locks: LockManager::new(timings.blacklist_ttl),
            attempt: 0,
            idle_status: MatchStatus::Idle,
            offline: false,
            reported: MatchStatus::Idle,
            matching_since: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    /// Attempt id of the current (or most recent) lock
    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn locked_peer(&self) -> Option<&PeerId> {
        self.locks.current()
    }

    pub fn is_blacklisted(&mut self, peer_id: &str, now: Instant) -> bool {
        self.locks.is_blacklisted(peer_id, now)
    }

    pub fn blacklist_len(&self) -> usize {
        self.locks.blacklist_len()
    }

    /// Status as the application sees it
    pub fn status(&self) -> MatchStatus {
        match &self.state {
            MatchState::Idle => self.idle_status,
            MatchState::Connected { .. } => MatchStatus::Connected,
            _ if self.offline => MatchStatus::ChannelOffline,
            MatchState::Matching | MatchState::Proposing { .. } | MatchState::Accepting { .. } => {
                MatchStatus::Matching
            }
            MatchState::Negotiating { .. } => MatchStatus::Negotiating,
        }
    }

    /// Single entry point for every input
    pub fn handle(&mut self, event: MatchEvent, now: Instant) -> Vec<MatchAction> {
        let mut actions = Vec::new();
        let before = self.state.name();

        match event {
            MatchEvent::MediaRequested => {
                if self.state == MatchState::Idle {
                    self.idle_status = MatchStatus::AcquiringMedia;
                }
            }
            MatchEvent::MediaReady => {
                if self.state == MatchState::Idle {
                    self.enter_matching(now, &mut actions);
                }
            }
            MatchEvent::MediaFailed { reason } => {
                if self.state == MatchState::Idle {
                    warn!("Local media unavailable for {}: {}", short_id(&self.peer_id), reason);
                    self.idle_status = MatchStatus::FatalError;
                }
            }
            MatchEvent::Message(message) => self.on_message(message, now, &mut actions),
            MatchEvent::MemberLeft(peer_id) => self.on_remote_left(&peer_id, now, &mut actions),
            MatchEvent::TimerFired { attempt, kind } => {
                self.on_timer(attempt, kind, now, &mut actions)
            }
            MatchEvent::SessionRequested {
                peer_id,
                request_id,
            } => self.on_session_request(peer_id, request_id, &mut actions),
            MatchEvent::SessionEstablished { attempt } => {
                self.on_session_established(attempt, now, &mut actions)
            }
            MatchEvent::SessionClosed { attempt } => {
                if attempt == self.attempt && self.in_session() {
                    self.terminate(LeaveReason::RemoteClosed, now, &mut actions);
                }
            }
            MatchEvent::SessionFailed { attempt, reason } => {
                if attempt == self.attempt && self.in_session() {
                    self.terminate(LeaveReason::SessionError(reason), now, &mut actions);
                }
            }
            MatchEvent::Skip { blacklist } => match self.state {
                MatchState::Idle => {}
                MatchState::Matching => self.announce(&mut actions),
                _ => {
                    let reason = if blacklist {
                        LeaveReason::Reported
                    } else {
                        LeaveReason::Skipped
                    };
                    self.terminate(reason, now, &mut actions)
                }
            },
            MatchEvent::ChannelOffline => self.offline = true,
            MatchEvent::ChannelOnline { reconnected } => {
                self.offline = false;
                if self.state == MatchState::Matching {
                    if reconnected {
                        info!("Re-announcing {} after reconnect", short_id(&self.peer_id));
                    }
                    self.announce(&mut actions);
                }
            }
            MatchEvent::PresenceTick => {
                if self.state == MatchState::Matching && !self.offline {
                    self.announce(&mut actions);
                }
            }
            MatchEvent::SweepTick => {
                let removed = self.locks.sweep(now);
                if removed > 0 {
                    debug!("Swept {} expired blacklist entries", removed);
                }
            }
            MatchEvent::Stop => self.stop(&mut actions),
        }

        if self.state.name() != before {
            info!(
                "Match state changed - peer: {}, from: {}, to: {}, partner: {}, attempt: {}",
                short_id(&self.peer_id),
                before,
                self.state.name(),
                self.state.partner().map(|p| short_id(p)).unwrap_or("-"),
                self.attempt
            );
        }

        let status = self.status();
        if status != self.reported {
            self.reported = status;
            actions.push(MatchAction::StatusChanged(status));
        }

        actions
    }

    fn on_message(&mut self, message: ChannelMessage, now: Instant, actions: &mut Vec<MatchAction>) {
        if self.state == MatchState::Idle || message.sender() == self.peer_id {
            return;
        }

        match message {
            ChannelMessage::Presence { peer_id, status } => {
                if status == PresenceStatus::Busy || self.state != MatchState::Matching {
                    return;
                }
                if !self.locks.try_lock(&peer_id, now) {
                    debug!("Ignoring presence from blacklisted peer {}", short_id(&peer_id));
                    return;
                }
                self.attempt += 1;
                self.state = MatchState::Proposing {
                    peer_id: peer_id.clone(),
                };
                actions.push(MatchAction::Broadcast(ChannelMessage::propose(
                    &self.peer_id,
                    &peer_id,
                )));
                actions.push(self.schedule(TimerKind::ProposalRetry, self.timings.proposal_retry));
                actions.push(
                    self.schedule(TimerKind::HandshakeDeadline, self.timings.proposal_deadline),
                );
            }
            ChannelMessage::MatchPropose { from_id, target_id } => {
                if target_id == self.peer_id {
                    self.on_proposal(from_id, now, actions);
                }
            }
            ChannelMessage::MatchAccept { from_id, target_id } => {
                if target_id == self.peer_id {
                    self.on_accept(from_id, actions);
                }
            }
            ChannelMessage::Leave { peer_id } => self.on_remote_left(&peer_id, now, actions),
        }
    }

    fn on_proposal(&mut self, from: PeerId, now: Instant, actions: &mut Vec<MatchAction>) {
        match &self.state {
            MatchState::Matching => {
                if !self.locks.try_lock(&from, now) {
                    debug!("Ignoring proposal from blacklisted peer {}", short_id(&from));
                    return;
                }
                self.attempt += 1;
                self.become_acceptor(from, actions);
            }
            MatchState::Proposing { peer_id } if *peer_id == from => {
                if self.peer_id.as_str() > from.as_str() {
                    debug!("Glare with {}, yielding the initiator role", short_id(&from));
                    actions.push(MatchAction::CancelTimers {
                        attempt: self.attempt,
                    });
                    self.attempt += 1;
                    self.become_acceptor(from, actions);
                } else {
                    debug!("Glare with {}, keeping the initiator role", short_id(&from));
                }
            }
            MatchState::Accepting { peer_id } if *peer_id == from => {
                // The first accept may have been lost
                actions.push(MatchAction::Broadcast(ChannelMessage::accept(
                    &self.peer_id,
                    &from,
                )));
            }
            _ => {}
        }
    }

    fn become_acceptor(&mut self, from: PeerId, actions: &mut Vec<MatchAction>) {
        actions.push(MatchAction::Broadcast(ChannelMessage::accept(
            &self.peer_id,
            &from,
        )));
        actions.push(self.schedule(TimerKind::HandshakeDeadline, self.timings.proposal_deadline));
        self.state = MatchState::Accepting { peer_id: from };
    }

    fn on_accept(&mut self, from: PeerId, actions: &mut Vec<MatchAction>) {
        let initiate = match &self.state {
            MatchState::Proposing { peer_id } => *peer_id == from,
            // Both sides accepted each other; only the lower id initiates
            MatchState::Accepting { peer_id } => {
                *peer_id == from && self.peer_id.as_str() < from.as_str()
            }
            _ => false,
        };
        if !initiate {
            return;
        }

        actions.push(MatchAction::CancelTimers {
            attempt: self.attempt,
        });
        actions.push(self.schedule(
            TimerKind::NegotiationDeadline,
            self.timings.negotiation_timeout,
        ));
        actions.push(MatchAction::InitiateSession {
            peer_id: from.clone(),
            attempt: self.attempt,
        });
        self.state = MatchState::Negotiating {
            peer_id: from,
            role: SessionRole::Initiator,
        };
    }

    fn on_session_request(
        &mut self,
        peer_id: PeerId,
        request_id: u64,
        actions: &mut Vec<MatchAction>,
    ) {
        let authorized = self.locks.is_locked_on(&peer_id)
            && matches!(
                self.state,
                MatchState::Proposing { .. }
                    | MatchState::Accepting { .. }
                    | MatchState::Negotiating {
                        role: SessionRole::Responder,
                        ..
                    }
            );

        if !authorized {
            info!(
                "Rejecting session request from {} while {}",
                short_id(&peer_id),
                self.state.name()
            );
            actions.push(MatchAction::RejectSession {
                request_id,
                peer_id,
            });
            return;
        }

        if !matches!(self.state, MatchState::Negotiating { .. }) {
            actions.push(MatchAction::CancelTimers {
                attempt: self.attempt,
            });
            actions.push(self.schedule(
                TimerKind::NegotiationDeadline,
                self.timings.negotiation_timeout,
            ));
            self.state = MatchState::Negotiating {
                peer_id: peer_id.clone(),
                role: SessionRole::Responder,
            };
        }

        actions.push(MatchAction::AnswerSession {
            request_id,
            peer_id,
            attempt: self.attempt,
        });
    }

    fn on_session_established(
        &mut self,
        attempt: AttemptId,
        now: Instant,
        actions: &mut Vec<MatchAction>,
    ) {
        if attempt != self.attempt {
            return;
        }
        if let MatchState::Negotiating { peer_id, role } = &self.state {
            let (peer_id, role) = (peer_id.clone(), *role);
            actions.push(MatchAction::CancelTimers { attempt });
            let waited = self
                .matching_since
                .take()
                .map(|since| now.duration_since(since))
                .unwrap_or_default();
            actions.push(MatchAction::PartnerConnected {
                peer_id: peer_id.clone(),
                role,
                waited,
            });
            self.state = MatchState::Connected { peer_id, role };
        }
    }

    fn on_timer(
        &mut self,
        attempt: AttemptId,
        kind: TimerKind,
        now: Instant,
        actions: &mut Vec<MatchAction>,
    ) {
        if attempt != self.attempt {
            debug!("Ignoring stale {:?} timer for attempt {}", kind, attempt);
            return;
        }

        let expired = match kind {
            TimerKind::ProposalRetry => {
                if let MatchState::Proposing { peer_id } = &self.state {
                    actions.push(MatchAction::Broadcast(ChannelMessage::propose(
                        &self.peer_id,
                        peer_id,
                    )));
                }
                false
            }
            TimerKind::HandshakeDeadline => matches!(
                self.state,
                MatchState::Proposing { .. } | MatchState::Accepting { .. }
            ),
            TimerKind::NegotiationDeadline => {
                matches!(self.state, MatchState::Negotiating { .. })
            }
        };

        if expired {
            self.terminate(LeaveReason::HandshakeTimeout, now, actions);
        }
    }

    fn on_remote_left(&mut self, peer_id: &str, now: Instant, actions: &mut Vec<MatchAction>) {
        if self.locks.is_locked_on(peer_id) {
            self.terminate(LeaveReason::RemoteLeft, now, actions);
        }
    }

    /// Release the partner and go back to matching
    fn terminate(&mut self, reason: LeaveReason, now: Instant, actions: &mut Vec<MatchAction>) {
        let blacklist = reason.blacklists();
        let Some(peer_id) = self.release(reason.clone(), actions) else {
            return;
        };
        if blacklist {
            self.locks.blacklist(&peer_id, now);
        }
        info!(
            "Partner released - peer: {}, partner: {}, reason: {}, blacklisted: {}",
            short_id(&self.peer_id),
            short_id(&peer_id),
            reason.label(),
            blacklist
        );
        self.enter_matching(now, actions);
    }

    /// Drop the lock with every timer and session tied to it
    fn release(&mut self, reason: LeaveReason, actions: &mut Vec<MatchAction>) -> Option<PeerId> {
        let peer_id = self.locks.release_lock()?;
        let was_connected = matches!(self.state, MatchState::Connected { .. });

        actions.push(MatchAction::CancelTimers {
            attempt: self.attempt,
        });
        if self.in_session() {
            actions.push(MatchAction::TearDownSession {
                attempt: self.attempt,
            });
        }
        actions.push(MatchAction::PartnerReleased {
            peer_id: peer_id.clone(),
            reason,
            was_connected,
        });
        Some(peer_id)
    }

    fn stop(&mut self, actions: &mut Vec<MatchAction>) {
        if self.state == MatchState::Idle && self.idle_status == MatchStatus::Disconnected {
            return;
        }
        self.release(LeaveReason::Shutdown, actions);
        self.state = MatchState::Idle;
        self.idle_status = MatchStatus::Disconnected;
        self.matching_since = None;
    }

    fn enter_matching(&mut self, now: Instant, actions: &mut Vec<MatchAction>) {
        self.state = MatchState::Matching;
        self.matching_since.get_or_insert(now);
        self.announce(actions);
    }

    fn announce(&self, actions: &mut Vec<MatchAction>) {
        actions.push(MatchAction::Broadcast(ChannelMessage::presence(&self.peer_id)));
    }

    fn in_session(&self) -> bool {
        matches!(
            self.state,
            MatchState::Negotiating { .. } | MatchState::Connected { .. }
        )
    }

    fn schedule(&self, kind: TimerKind, after: Duration) -> MatchAction {
        MatchAction::Schedule {
            attempt: self.attempt,
            kind,
            after,
        }
    }
}
