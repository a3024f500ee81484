//! Main application state and service coordination
//!
//! This module contains the production AppState that wires the broadcast
//! transport, the session hub and the local pairing engines together and runs
//! the background tasks around them.

use crate::channel::{AmqpBroadcastTransport, AmqpConfig, BroadcastTransport, LocalBroadcastHub};
use crate::config::{AppConfig, ChannelBackend};
use crate::matchmaking::{EngineConfig, EngineDeps, EngineHandle, EngineNotification, MatchEngine};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector};
use crate::service::health::{HealthCheck, HealthStatus, PeerReport, ServiceStats};
use crate::session::{LocalSessionHub, SyntheticMediaSource};
use crate::utils::{generate_peer_id, short_id};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Interval of the health metrics task
const HEALTH_METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Broadcast channel setup error: {message}")]
    ChannelSetup { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,

    metrics_collector: Arc<MetricsCollector>,

    /// Kept alive for the lifetime of the engines
    _sessions: LocalSessionHub,

    engines: Vec<EngineHandle>,

    health_server: Mutex<Option<Arc<HealthServer>>>,

    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    is_running: Arc<RwLock<bool>>,

    started_at: Instant,
}

impl AppState {
    /// Initialize the application with the transport named in the configuration
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let transport = Self::initialize_transport(&config)?;
        Self::with_transport(config, transport).await
    }

    /// Initialize the application on top of an existing broadcast transport
    pub async fn with_transport(
        config: AppConfig,
        transport: Arc<dyn BroadcastTransport>,
    ) -> Result<Self, ServiceError> {
        info!("Initializing roulette-room peer service");
        info!(
            "Configuration: service={}, backend={:?}, region={}, peers={}",
            config.service.name,
            config.channel.backend,
            config.channel.region,
            config.service.local_peers
        );

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let sessions = LocalSessionHub::new();
        let engine_config = EngineConfig::from(&config);
        let mut engines = Vec::with_capacity(config.service.local_peers);

        for _ in 0..config.service.local_peers {
            let peer_id = generate_peer_id();
            let (endpoint, requests) =
                sessions
                    .endpoint(&peer_id)
                    .map_err(|e| ServiceError::Initialization {
                        message: format!("Failed to register session endpoint: {}", e),
                    })?;

            debug!("Spawning pairing engine {}", short_id(&peer_id));
            engines.push(MatchEngine::spawn(
                engine_config.clone(),
                EngineDeps {
                    peer_id,
                    broadcast: transport.clone(),
                    sessions: Arc::new(endpoint),
                    session_requests: requests,
                    metrics: metrics_collector.clone(),
                },
            ));
        }

        Ok(Self {
            config,
            metrics_collector,
            _sessions: sessions,
            engines,
            health_server: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Start the health server, every engine and the background tasks
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting roulette-room peer service");

        *self.is_running.write().await = true;

        if self.config.service.enable_health_server {
            self.start_health_server().await;
        }

        self.start_engines().await?;
        self.start_background_tasks().await;

        info!("Roulette-room peer service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of roulette-room service");

        *self.is_running.write().await = false;

        for engine in &self.engines {
            if let Err(e) = engine.stop().await {
                warn!("Failed to stop engine {}: {}", short_id(engine.peer_id()), e);
            }
        }
        info!("All {} engines stopped", self.engines.len());

        self.stop_background_tasks().await;

        if let Some(server) = self.health_server.lock().await.take() {
            if let Err(e) = server.stop().await {
                warn!("Failed to stop health server: {}", e);
            }
        }

        info!("Roulette-room service shutdown completed");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn engines(&self) -> &[EngineHandle] {
        &self.engines
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current status of every local peer
    pub fn peer_reports(&self) -> Vec<PeerReport> {
        self.engines
            .iter()
            .map(|engine| PeerReport {
                peer_id: engine.peer_id().clone(),
                status: engine.status(),
            })
            .collect()
    }

    fn initialize_transport(config: &AppConfig) -> Result<Arc<dyn BroadcastTransport>, ServiceError> {
        match config.channel.backend {
            ChannelBackend::Amqp => {
                info!("Using AMQP broadcast transport: {}", config.channel.url);
                let mut amqp_config = AmqpConfig::from_url(&config.channel.url).map_err(|e| {
                    ServiceError::ChannelSetup {
                        message: format!("Failed to parse AMQP URL: {}", e),
                    }
                })?;
                amqp_config.liveness_check = config.liveness_check_interval();
                Ok(Arc::new(AmqpBroadcastTransport::new(amqp_config)))
            }
            ChannelBackend::Local => {
                info!("Using in-process broadcast transport");
                Ok(Arc::new(LocalBroadcastHub::new()))
            }
        }
    }

    async fn start_health_server(self: &Arc<Self>) {
        let port = self.config.service.health_port;
        info!("Starting health and metrics endpoints on port {}", port);

        let server = Arc::new(
            HealthServer::new(
                HealthServerConfig {
                    port,
                    host: "0.0.0.0".to_string(),
                },
                self.metrics_collector.clone(),
            )
            .with_app_state(self.clone()),
        );

        let task_server = server.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = task_server.start().await {
                error!("Health server failed: {}", e);
            }
        });

        *self.health_server.lock().await = Some(server);
        self.background_tasks.lock().await.push(handle);
    }

    async fn start_engines(&self) -> Result<(), ServiceError> {
        let region = self.config.channel.region;
        let mut started = 0;

        for engine in &self.engines {
            match engine
                .start(region, Arc::new(SyntheticMediaSource::new()))
                .await
            {
                Ok(()) => started += 1,
                Err(e) => error!(
                    "Engine {} failed to start: {}",
                    short_id(engine.peer_id()),
                    e
                ),
            }
        }

        if started == 0 && !self.engines.is_empty() {
            return Err(ServiceError::Initialization {
                message: "No pairing engine could be started".to_string(),
            });
        }

        info!("{} of {} engines matching in {}", started, self.engines.len(), region);
        Ok(())
    }

    async fn start_background_tasks(&self) {
        let mut tasks = self.background_tasks.lock().await;

        for engine in &self.engines {
            tasks.push(tokio::spawn(log_notifications(
                engine.peer_id().clone(),
                engine.subscribe(),
            )));
        }

        // Service health metrics task
        let health_task = {
            let metrics_collector = self.metrics_collector.clone();
            let engines = self.engines.clone();
            let is_running = self.is_running.clone();
            let started_at = self.started_at;

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEALTH_METRICS_INTERVAL);

                while *is_running.read().await {
                    interval.tick().await;

                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(started_at.elapsed().as_secs() as i64);

                    let reports: Vec<PeerReport> = engines
                        .iter()
                        .map(|engine| PeerReport {
                            peer_id: engine.peer_id().clone(),
                            status: engine.status(),
                        })
                        .collect();
                    let stats = ServiceStats::from_reports(&reports, 0);
                    let (status, checks) = HealthCheck::evaluate(true, &stats);
                    metrics_collector.update_health_status(status.as_gauge());
                    for component in &checks {
                        metrics_collector.update_component_health(
                            &component.name,
                            component.status != HealthStatus::Unhealthy,
                        );
                    }
                    debug!("Updated service health metrics - status: {}", status);
                }
            })
        };
        tasks.push(health_task);

        info!("{} background tasks started", tasks.len());
    }

    async fn stop_background_tasks(&self) {
        let mut tasks = self.background_tasks.lock().await;
        let task_count = tasks.len();

        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("Aborted {} background tasks", task_count);
    }
}

/// Log what happens to one local peer
async fn log_notifications(
    peer_id: String,
    mut notifications: broadcast::Receiver<EngineNotification>,
) {
    loop {
        match notifications.recv().await {
            Ok(EngineNotification::PartnerConnected {
                peer_id: partner,
                role,
                stream,
            }) => info!(
                "Peer {} connected to {} as {} (stream: {})",
                short_id(&peer_id),
                short_id(&partner),
                role,
                stream
                    .map(|s| s.stream_id)
                    .unwrap_or_else(|| "none".to_string())
            ),
            Ok(EngineNotification::AppMessage {
                peer_id: partner,
                payload,
            }) => info!(
                "Peer {} received {} bytes from {}",
                short_id(&peer_id),
                payload.len(),
                short_id(&partner)
            ),
            Ok(EngineNotification::PartnerLeft {
                peer_id: partner,
                reason,
            }) => info!(
                "Peer {} lost partner {} ({})",
                short_id(&peer_id),
                short_id(&partner),
                reason.label()
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Notification log for {} skipped {} events", short_id(&peer_id), skipped)
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchStatus;

    fn local_config(peers: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.channel.backend = ChannelBackend::Local;
        config.service.local_peers = peers;
        config.service.enable_health_server = false;
        config
    }

    #[tokio::test]
    async fn test_builds_requested_engines() {
        let state = AppState::new(local_config(3)).await.unwrap();

        assert_eq!(state.engines().len(), 3);
        assert!(!state.is_running().await);
        assert!(state
            .peer_reports()
            .iter()
            .all(|report| report.status == MatchStatus::Idle));
    }

    #[tokio::test]
    async fn test_invalid_amqp_url_is_rejected() {
        let mut config = local_config(1);
        config.channel.backend = ChannelBackend::Amqp;
        config.channel.url = "http://not-a-broker".to_string();

        let result = AppState::new(config).await;
        assert!(matches!(result, Err(ServiceError::ChannelSetup { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let state = Arc::new(AppState::new(local_config(2)).await.unwrap());
        state.start().await.unwrap();

        assert!(state.is_running().await);
        for engine in state.engines() {
            engine
                .wait_for_status(|status| {
                    matches!(
                        status,
                        MatchStatus::Matching | MatchStatus::Negotiating | MatchStatus::Connected
                    )
                })
                .await
                .unwrap();
        }

        state.shutdown().await.unwrap();
        assert!(!state.is_running().await);
        assert!(state
            .peer_reports()
            .iter()
            .all(|report| report.status == MatchStatus::Disconnected));
    }
}
