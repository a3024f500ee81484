//! Health check endpoints and monitoring
//!
//! Health is derived from the status every local engine publishes: a peer that
//! lost its media is failed, a peer whose channel dropped is offline, anything
//! else is serving.

use crate::service::app::AppState;
use crate::types::{MatchStatus, PeerId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Numeric form used by the health gauge
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        if self.as_gauge() <= other.as_gauge() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Optional explanation when not healthy
    pub message: Option<String>,
}

/// Status of one local peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReport {
    pub peer_id: PeerId,
    pub status: MatchStatus,
}

/// Per-status tally of the local peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub peers: usize,
    pub matching: usize,
    pub negotiating: usize,
    pub connected: usize,
    pub offline: usize,
    pub failed: usize,
    pub uptime_seconds: u64,
}

impl ServiceStats {
    /// Tally a set of peer statuses
    pub fn from_reports(reports: &[PeerReport], uptime_seconds: u64) -> Self {
        let mut stats = ServiceStats {
            peers: reports.len(),
            uptime_seconds,
            ..Default::default()
        };
        for report in reports {
            match report.status {
                MatchStatus::Matching => stats.matching += 1,
                MatchStatus::Negotiating => stats.negotiating += 1,
                MatchStatus::Connected => stats.connected += 1,
                MatchStatus::ChannelOffline => stats.offline += 1,
                MatchStatus::FatalError => stats.failed += 1,
                MatchStatus::Idle | MatchStatus::AcquiringMedia | MatchStatus::Disconnected => {}
            }
        }
        stats
    }

    /// Peers that are neither failed nor offline
    pub fn serving(&self) -> usize {
        self.matching + self.negotiating + self.connected
    }
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let running = app_state.is_running().await;
        let reports = app_state.peer_reports();
        let stats = ServiceStats::from_reports(&reports, app_state.uptime().as_secs());

        let (status, checks) = Self::evaluate(running, &stats);

        Ok(HealthCheck {
            status,
            service: app_state.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Overall status and per-component checks for a tally of peers
    pub fn evaluate(running: bool, stats: &ServiceStats) -> (HealthStatus, Vec<ComponentCheck>) {
        let checks = vec![
            Self::check_service_running(running),
            Self::check_media(stats),
            Self::check_channel(stats),
        ];
        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));
        (status, checks)
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if app_state.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness: running with at least one peer that has media and is online
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if !app_state.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }

        let stats = ServiceStats::from_reports(&app_state.peer_reports(), 0);
        Ok(Self::readiness_from_stats(&stats))
    }

    fn readiness_from_stats(stats: &ServiceStats) -> HealthStatus {
        match stats.serving() {
            0 => HealthStatus::Unhealthy,
            n if n < stats.peers => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    fn check_service_running(running: bool) -> ComponentCheck {
        let (status, message) = if running {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
        }
    }

    fn check_media(stats: &ServiceStats) -> ComponentCheck {
        let (status, message) = match stats.failed {
            0 => (HealthStatus::Healthy, None),
            n if n == stats.peers => (
                HealthStatus::Unhealthy,
                Some("No peer could acquire local media".to_string()),
            ),
            n => (
                HealthStatus::Degraded,
                Some(format!("{} of {} peers have no local media", n, stats.peers)),
            ),
        };

        ComponentCheck {
            name: "media".to_string(),
            status,
            message,
        }
    }

    fn check_channel(stats: &ServiceStats) -> ComponentCheck {
        let (status, message) = match stats.offline {
            0 => (HealthStatus::Healthy, None),
            n if n == stats.peers => (
                HealthStatus::Unhealthy,
                Some("Broadcast channel is offline".to_string()),
            ),
            n => (
                HealthStatus::Degraded,
                Some(format!("{} of {} peers are offline", n, stats.peers)),
            ),
        };

        ComponentCheck {
            name: "broadcast_channel".to_string(),
            status,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports(statuses: &[MatchStatus]) -> Vec<PeerReport> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| PeerReport {
                peer_id: format!("peer-{}", i),
                status: *status,
            })
            .collect()
    }

    #[test]
    fn test_stats_tally() {
        let stats = ServiceStats::from_reports(
            &reports(&[
                MatchStatus::Matching,
                MatchStatus::Connected,
                MatchStatus::Connected,
                MatchStatus::ChannelOffline,
                MatchStatus::FatalError,
            ]),
            42,
        );

        assert_eq!(stats.peers, 5);
        assert_eq!(stats.matching, 1);
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.serving(), 3);
        assert_eq!(stats.uptime_seconds, 42);
    }

    #[test]
    fn test_readiness_from_stats() {
        let all_good = ServiceStats::from_reports(
            &reports(&[MatchStatus::Matching, MatchStatus::Connected]),
            0,
        );
        assert_eq!(HealthCheck::readiness_from_stats(&all_good), HealthStatus::Healthy);

        let partial = ServiceStats::from_reports(
            &reports(&[MatchStatus::Matching, MatchStatus::ChannelOffline]),
            0,
        );
        assert_eq!(HealthCheck::readiness_from_stats(&partial), HealthStatus::Degraded);

        let none = ServiceStats::from_reports(
            &reports(&[MatchStatus::FatalError, MatchStatus::ChannelOffline]),
            0,
        );
        assert_eq!(HealthCheck::readiness_from_stats(&none), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_component_checks() {
        let stats = ServiceStats::from_reports(
            &reports(&[MatchStatus::FatalError, MatchStatus::Matching]),
            0,
        );
        assert_eq!(HealthCheck::check_media(&stats).status, HealthStatus::Degraded);
        assert_eq!(HealthCheck::check_channel(&stats).status, HealthStatus::Healthy);

        let offline = ServiceStats::from_reports(&reports(&[MatchStatus::ChannelOffline]), 0);
        assert_eq!(
            HealthCheck::check_channel(&offline).status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_evaluate_takes_worst_component() {
        let stats = ServiceStats::from_reports(
            &reports(&[MatchStatus::Connected, MatchStatus::ChannelOffline]),
            0,
        );
        let (status, checks) = HealthCheck::evaluate(true, &stats);
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(checks.len(), 3);

        let (status, _) = HealthCheck::evaluate(false, &stats);
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_worst_status() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
        assert_eq!(HealthStatus::Healthy.as_gauge(), 2);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }
}
