//! Metrics and monitoring for the roulette-room service
//!
//! Prometheus collection for the channel and pairing layers, plus the HTTP
//! server exposing health, per-peer status and metrics.

pub mod collector;
pub mod health;

pub use collector::{ChannelMetrics, MatchMetrics, MetricsCollector, ServiceMetrics};
pub use health::{HealthServer, HealthServerConfig};
