//! Configuration management for the roulette-room service
//!
//! This module handles all configuration loading from environment variables and
//! TOML files, validation, and default values for the pairing engine.

pub mod app;

// Re-export commonly used types
pub use app::{
    validate_config, AppConfig, ChannelBackend, ChannelSettings, MatchmakingSettings,
    ReconnectStrategy, ServiceSettings,
};
