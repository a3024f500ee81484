//! Reconnecting broadcast channel client
//!
//! The client owns the region connection exclusively. A supervisor task keeps
//! it alive: any close the owner did not ask for is followed by a reconnect
//! after the configured delay, and connect failures are retried forever. Only
//! `shutdown` stops the loop, so engine teardown never turns into a reconnect
//! storm.

use crate::channel::messages::{ChannelMessage, MessageUtils};
use crate::channel::transport::{BroadcastTransport, TransportConnection, TransportFrame};
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{PeerId, Region};
use crate::utils::short_id;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay schedule between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt
    Fixed(Duration),
    /// Doubling delay capped at `max`, with full jitter
    ExponentialJitter { base: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_secs(3))
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::ExponentialJitter { base, max } => {
                let ceiling = Self::ceiling(base, max, attempt);
                let millis = ceiling.as_millis() as u64;
                if millis == 0 {
                    return ceiling;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            }
        }
    }

    fn ceiling(base: Duration, max: Duration, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exponent).min(max)
    }
}

/// What the client reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection is up; `reconnected` is false for the first one
    Online { reconnected: bool },
    /// The connection dropped or could not be established
    Offline,
    /// A valid record from another member
    Message(ChannelMessage),
    /// Transport notice that a member disconnected
    MemberLeft(PeerId),
}

enum ClientCommand {
    Send(ChannelMessage),
    Shutdown,
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

/// Handle to the region connection
pub struct BroadcastClient {
    peer_id: PeerId,
    region: Region,
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: Option<JoinHandle<()>>,
}

impl BroadcastClient {
    /// Start the supervisor; events are delivered on `events`
    pub fn connect(
        transport: Arc<dyn BroadcastTransport>,
        region: Region,
        peer_id: PeerId,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<ClientEvent>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            transport,
            region,
            peer_id: peer_id.clone(),
            policy,
            events,
            commands: command_rx,
            metrics,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            peer_id,
            region,
            commands,
            task: Some(task),
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Queue a record for publishing; dropped with a debug log while offline
    pub fn send(&self, message: ChannelMessage) -> Result<()> {
        self.commands
            .send(ClientCommand::Send(message))
            .map_err(|_| MatchmakingError::ChannelClosed.into())
    }

    /// Close on purpose: announce the leave, close the link, never reconnect
    pub async fn shutdown(mut self, timeout: Duration) {
        let _ = self.commands.send(ClientCommand::Shutdown);
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(timeout, task).await {
                Ok(_) => debug!("Broadcast client for {} stopped", short_id(&self.peer_id)),
                Err(_) => warn!(
                    "Broadcast client for {} did not stop within {:?}",
                    short_id(&self.peer_id),
                    timeout
                ),
            }
        }
    }
}

impl Drop for BroadcastClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Supervisor {
    transport: Arc<dyn BroadcastTransport>,
    region: Region,
    peer_id: PeerId,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    metrics: Arc<MetricsCollector>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut connected_before = false;
        let mut failures: u32 = 0;
        let mut offline_reported = false;

        loop {
            match self.transport.connect(self.region, &self.peer_id).await {
                Ok(connection) => {
                    info!(
                        "Broadcast channel online - peer: {}, region: {}, reconnected: {}",
                        short_id(&self.peer_id),
                        self.region,
                        connected_before
                    );
                    if connected_before {
                        self.metrics.record_channel_reconnect();
                    }
                    let _ = self.events.send(ClientEvent::Online {
                        reconnected: connected_before,
                    });
                    connected_before = true;
                    failures = 0;
                    offline_reported = false;

                    match self.pump(connection).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Dropped => {
                            let _ = self.events.send(ClientEvent::Offline);
                            offline_reported = true;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Broadcast channel connect failed - peer: {}, region: {}, error: {}",
                        short_id(&self.peer_id),
                        self.region,
                        e
                    );
                    if !offline_reported {
                        let _ = self.events.send(ClientEvent::Offline);
                        offline_reported = true;
                    }
                }
            }

            failures += 1;
            let delay = self.policy.delay(failures);
            info!("Reconnecting broadcast channel in {:?}", delay);
            if !self.wait_before_retry(delay).await {
                return;
            }
        }
    }

    /// Sleep until the next attempt; false if the owner shut down meanwhile
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(message)) => {
                        debug!("Channel offline, dropping {} message", message.msg_type());
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        info!("Broadcast client shut down while offline");
                        return false;
                    }
                },
            }
        }
    }

    async fn pump(&mut self, mut connection: TransportConnection) -> SessionEnd {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(message)) => {
                        self.publish(&connection, &message).await;
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        let leave = ChannelMessage::leave(&self.peer_id);
                        self.publish(&connection, &leave).await;
                        if let Err(e) = connection.link.close().await {
                            warn!("Failed to close broadcast link cleanly: {}", e);
                        }
                        info!("Broadcast channel closed for {}", short_id(&self.peer_id));
                        return SessionEnd::Shutdown;
                    }
                },
                frame = connection.inbound.recv() => match frame {
                    Some(TransportFrame::Payload(bytes)) => self.deliver(&bytes),
                    Some(TransportFrame::MemberLeft(peer_id)) => {
                        let _ = self.events.send(ClientEvent::MemberLeft(peer_id));
                    }
                    Some(TransportFrame::Dropped(reason)) => {
                        warn!("Broadcast channel dropped: {}", reason);
                        return SessionEnd::Dropped;
                    }
                    None => {
                        warn!("Broadcast channel inbound stream ended");
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }

    async fn publish(&self, connection: &TransportConnection, message: &ChannelMessage) {
        let payload = match MessageUtils::serialize(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Refusing to publish invalid message: {}", e);
                return;
            }
        };
        match connection.link.publish(payload).await {
            Ok(()) => {
                debug!("Published {}", message.msg_type());
                self.metrics
                    .record_channel_message(message.msg_type(), "outbound");
            }
            Err(e) => warn!("Failed to publish {}: {}", message.msg_type(), e),
        }
    }

    fn deliver(&self, bytes: &[u8]) {
        match MessageUtils::deserialize(bytes) {
            Ok(message) => {
                if message.sender() == self.peer_id {
                    return;
                }
                self.metrics
                    .record_channel_message(message.msg_type(), "inbound");
                let _ = self.events.send(ClientEvent::Message(message));
            }
            Err(e) => {
                warn!("Skipping invalid channel message ({} bytes): {}", bytes.len(), e);
            }
        }
    }
}
