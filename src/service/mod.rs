//! Service layer for the roulette-room peer service
//!
//! This module contains the main application state, service coordination,
//! and health evaluation for the production binary.

pub mod app;
pub mod health;

pub use app::{AppState, ServiceError};
pub use health::{ComponentCheck, HealthCheck, HealthStatus, PeerReport, ServiceStats};
