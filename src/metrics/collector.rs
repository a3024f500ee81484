//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the roulette-room pairing
//! service. One collector is shared by every local engine.

use crate::types::{LeaveReason, SessionRole};
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::Duration;

/// Main metrics collector for the pairing service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Broadcast channel metrics
    channel_metrics: ChannelMetrics,

    /// Handshake and session metrics
    match_metrics: MatchMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Broadcast channel metrics
#[derive(Clone)]
pub struct ChannelMetrics {
    /// Channel records by type and direction
    pub messages_total: IntCounterVec,

    /// Reconnects after an unexpected drop
    pub reconnects_total: IntCounter,
}

/// Handshake and session metrics
#[derive(Clone)]
pub struct MatchMetrics {
    /// Proposals published, including retries
    pub proposals_sent_total: IntCounter,

    /// Accepts published
    pub accepts_sent_total: IntCounter,

    /// Sessions established, by role
    pub matches_total: IntCounterVec,

    /// Partners released, by reason
    pub partners_released_total: IntCounterVec,

    /// Handshakes abandoned at a deadline
    pub handshake_timeouts_total: IntCounter,

    /// Inbound session requests refused
    pub rejected_sessions_total: IntCounter,

    /// Peers currently blacklisted across all engines
    pub blacklist_size: IntGauge,

    /// Sessions currently connected
    pub active_sessions: IntGauge,

    /// Time from entering matching to a connected session
    pub time_to_match_seconds: Histogram,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let channel_metrics = ChannelMetrics::new(&registry)?;
        let match_metrics = MatchMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            channel_metrics,
            match_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn channel(&self) -> &ChannelMetrics {
        &self.channel_metrics
    }

    pub fn matching(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    /// Record one channel record; `direction` is "inbound" or "outbound"
    pub fn record_channel_message(&self, msg_type: &str, direction: &str) {
        self.channel_metrics
            .messages_total
            .with_label_values(&[msg_type, direction])
            .inc();

        if direction == "outbound" {
            match msg_type {
                "match-propose" => self.match_metrics.proposals_sent_total.inc(),
                "match-accept" => self.match_metrics.accepts_sent_total.inc(),
                _ => {}
            }
        }
    }

    pub fn record_channel_reconnect(&self) {
        self.channel_metrics.reconnects_total.inc();
    }

    /// Record a session reaching the connected state
    pub fn record_match(&self, role: SessionRole, waited: Duration) {
        let role_str = match role {
            SessionRole::Initiator => "initiator",
            SessionRole::Responder => "responder",
        };

        self.match_metrics
            .matches_total
            .with_label_values(&[role_str])
            .inc();
        self.match_metrics.active_sessions.inc();
        self.match_metrics
            .time_to_match_seconds
            .observe(waited.as_secs_f64());
    }

    /// Record the lock on a partner being released
    pub fn record_partner_released(&self, reason: &LeaveReason, was_connected: bool) {
        self.match_metrics
            .partners_released_total
            .with_label_values(&[reason.label()])
            .inc();

        if *reason == LeaveReason::HandshakeTimeout {
            self.match_metrics.handshake_timeouts_total.inc();
        }
        if was_connected {
            self.match_metrics.active_sessions.dec();
        }
    }

    pub fn record_session_rejected(&self) {
        self.match_metrics.rejected_sessions_total.inc();
    }

    /// Apply a change in one engine's blacklist size
    pub fn adjust_blacklist_size(&self, delta: i64) {
        if delta != 0 {
            self.match_metrics.blacklist_size.add(delta);
        }
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("roulette_room_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "roulette_room_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("roulette_room_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

impl ChannelMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let messages_total = IntCounterVec::new(
            Opts::new(
                "roulette_room_channel_messages_total",
                "Broadcast channel records",
            ),
            &["type", "direction"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let reconnects_total = IntCounter::new(
            "roulette_room_channel_reconnects_total",
            "Broadcast channel reconnects after a drop",
        )?;
        registry.register(Box::new(reconnects_total.clone()))?;

        Ok(Self {
            messages_total,
            reconnects_total,
        })
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let proposals_sent_total = IntCounter::new(
            "roulette_room_proposals_sent_total",
            "Proposals published",
        )?;
        registry.register(Box::new(proposals_sent_total.clone()))?;

        let accepts_sent_total =
            IntCounter::new("roulette_room_accepts_sent_total", "Accepts published")?;
        registry.register(Box::new(accepts_sent_total.clone()))?;

        let matches_total = IntCounterVec::new(
            Opts::new("roulette_room_matches_total", "Sessions established"),
            &["role"],
        )?;
        registry.register(Box::new(matches_total.clone()))?;

        let partners_released_total = IntCounterVec::new(
            Opts::new(
                "roulette_room_partners_released_total",
                "Partner locks released",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(partners_released_total.clone()))?;

        let handshake_timeouts_total = IntCounter::new(
            "roulette_room_handshake_timeouts_total",
            "Handshakes abandoned at a deadline",
        )?;
        registry.register(Box::new(handshake_timeouts_total.clone()))?;

        let rejected_sessions_total = IntCounter::new(
            "roulette_room_rejected_sessions_total",
            "Unauthorized inbound session requests",
        )?;
        registry.register(Box::new(rejected_sessions_total.clone()))?;

        let blacklist_size =
            IntGauge::new("roulette_room_blacklist_size", "Blacklisted peers")?;
        registry.register(Box::new(blacklist_size.clone()))?;

        let active_sessions =
            IntGauge::new("roulette_room_active_sessions", "Connected sessions")?;
        registry.register(Box::new(active_sessions.clone()))?;

        let time_to_match_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "roulette_room_time_to_match_seconds",
                "Time from matching to connected",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(time_to_match_seconds.clone()))?;

        Ok(Self {
            proposals_sent_total,
            accepts_sent_total,
            matches_total,
            partners_released_total,
            handshake_timeouts_total,
            rejected_sessions_total,
            blacklist_size,
            active_sessions,
            time_to_match_seconds,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}
