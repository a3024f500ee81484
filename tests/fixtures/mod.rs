//! Test fixtures for end-to-end pairing scenarios
//!
//! Everything runs on the in-process broadcast hub and session hub, so whole
//! handshakes can be driven under a paused tokio clock.

#![allow(dead_code)]

use roulette_room::channel::messages::{ChannelMessage, MessageUtils};
use roulette_room::channel::transport::{
    BroadcastLink, BroadcastTransport, TransportConnection, TransportFrame,
};
use roulette_room::channel::LocalBroadcastHub;
use roulette_room::matchmaking::{
    EngineConfig, EngineDeps, EngineHandle, EngineNotification, MatchEngine,
};
use roulette_room::metrics::MetricsCollector;
use roulette_room::session::{LocalSessionHub, SyntheticMediaSource};
use roulette_room::types::{MatchStatus, Region};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default upper bound for waiting on an engine in tests
pub const WAIT: Duration = Duration::from_secs(60);

/// A shared in-process network for a set of engines
pub struct TestNetwork {
    pub broadcast: LocalBroadcastHub,
    pub sessions: LocalSessionHub,
    pub metrics: Arc<MetricsCollector>,
    pub config: EngineConfig,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            broadcast: LocalBroadcastHub::new(),
            sessions: LocalSessionHub::new(),
            metrics: Arc::new(MetricsCollector::new().expect("Failed to create collector")),
            config: EngineConfig::default(),
        }
    }

    /// Spawn an engine without starting it
    pub fn engine(&self, peer_id: &str) -> EngineHandle {
        let (endpoint, requests) = self
            .sessions
            .endpoint(peer_id)
            .expect("Failed to register session endpoint");

        MatchEngine::spawn(
            self.config.clone(),
            EngineDeps {
                peer_id: peer_id.to_string(),
                broadcast: Arc::new(self.broadcast.clone()),
                sessions: Arc::new(endpoint),
                session_requests: requests,
                metrics: self.metrics.clone(),
            },
        )
    }

    /// Spawn an engine and start it with synthetic media in `region`
    pub async fn started(&self, peer_id: &str, region: Region) -> EngineHandle {
        let engine = self.engine(peer_id);
        engine
            .start(region, Arc::new(SyntheticMediaSource::new()))
            .await
            .expect("Failed to start engine");
        engine
    }

    /// Join a region as a bare channel member that speaks the wire protocol by hand
    pub async fn observer(&self, peer_id: &str, region: Region) -> Observer {
        let connection = self
            .broadcast
            .connect(region, &peer_id.to_string())
            .await
            .expect("Failed to connect observer");
        Observer {
            peer_id: peer_id.to_string(),
            connection,
        }
    }
}

/// Raw channel member used to impersonate misbehaving peers
pub struct Observer {
    pub peer_id: String,
    connection: TransportConnection,
}

impl Observer {
    pub async fn publish(&self, message: &ChannelMessage) {
        let payload = MessageUtils::serialize(message).expect("Failed to serialize");
        self.connection
            .link
            .publish(payload)
            .await
            .expect("Failed to publish");
    }

    /// Next frame of any kind
    pub async fn next_frame(&mut self) -> TransportFrame {
        tokio::time::timeout(WAIT, self.connection.inbound.recv())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Observer connection closed")
    }

    /// Next decoded channel message, skipping membership frames
    pub async fn next_message(&mut self) -> ChannelMessage {
        loop {
            if let TransportFrame::Payload(bytes) = self.next_frame().await {
                return MessageUtils::deserialize(&bytes).expect("Invalid message on channel");
            }
        }
    }

    /// Discard everything already delivered
    pub fn drain(&mut self) {
        while self.connection.inbound.try_recv().is_ok() {}
    }

    /// Next message that satisfies `predicate`
    pub async fn next_matching<F>(&mut self, predicate: F) -> ChannelMessage
    where
        F: Fn(&ChannelMessage) -> bool,
    {
        loop {
            let message = self.next_message().await;
            if predicate(&message) {
                return message;
            }
        }
    }
}

/// Wait until `engine` reports `status`
pub async fn wait_for(engine: &EngineHandle, status: MatchStatus) {
    tokio::time::timeout(WAIT, engine.wait_for_status(|current| current == status))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "{} never reached {} (last: {})",
                engine.peer_id(),
                status,
                engine.status()
            )
        })
        .expect("Engine stopped");
}

/// Next notification from an engine subscription
pub async fn next_notification(
    notifications: &mut broadcast::Receiver<EngineNotification>,
) -> EngineNotification {
    tokio::time::timeout(WAIT, notifications.recv())
        .await
        .expect("Timed out waiting for a notification")
        .expect("Notification stream closed")
}

/// Skip notifications until a connection is reported
pub async fn next_connection(
    notifications: &mut broadcast::Receiver<EngineNotification>,
) -> EngineNotification {
    loop {
        let notification = next_notification(notifications).await;
        if matches!(notification, EngineNotification::PartnerConnected { .. }) {
            return notification;
        }
    }
}

/// Start two engines in order and wait for them to pair
pub async fn connected_pair(
    network: &TestNetwork,
    first: &str,
    second: &str,
) -> (EngineHandle, EngineHandle) {
    let a = network.started(first, Region::Global).await;
    let b = network.started(second, Region::Global).await;
    wait_for(&a, MatchStatus::Connected).await;
    wait_for(&b, MatchStatus::Connected).await;
    (a, b)
}
