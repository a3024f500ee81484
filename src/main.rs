//! Main entry point for the Roulette Room peer service
//!
//! Runs one or more local pairing engines against a region channel, serves
//! health and metrics endpoints, and shuts down gracefully on SIGINT/SIGTERM.

use anyhow::Result;
use clap::Parser;
use roulette_room::config::{validate_config, AppConfig, ChannelBackend};
use roulette_room::service::{AppState, HealthCheck};
use roulette_room::types::Region;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Roulette Room - random peer-to-peer video chat pairing
#[derive(Parser)]
#[command(
    name = "roulette-room",
    version,
    about = "Pairs strangers for one-to-one video chat over a shared region channel",
    long_about = "Roulette Room runs pairing engines that announce themselves on a region \
                 broadcast channel, agree on a partner through a propose/accept handshake, \
                 and hand both sides over to a point-to-point session."
)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    #[arg(long, value_name = "REGION", help = "Region channel to join (e.g. global, europe)")]
    region: Option<Region>,

    #[arg(long, value_name = "N", help = "Number of local peers to run")]
    peers: Option<usize>,

    #[arg(long, help = "Use the in-process broadcast channel instead of AMQP")]
    local_bus: bool,

    #[arg(long, value_name = "PORT", help = "Override health server port")]
    health_port: Option<u16>,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary every 30s
async fn health_check_task(app_state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while app_state.is_running().await {
        interval.tick().await;

        match HealthCheck::check(app_state.clone()).await {
            Ok(health) => info!(
                "Health check: {} - {} matching, {} connected, {} offline, {} failed",
                health.status,
                health.stats.matching,
                health.stats.connected,
                health.stats.offline,
                health.stats.failed
            ),
            Err(e) => warn!("Health check failed: {}", e),
        }
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("Roulette Room Peer Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    match config.channel.backend {
        ChannelBackend::Amqp => info!("   Channel: AMQP {}", config.channel.url),
        ChannelBackend::Local => info!("   Channel: in-process"),
    }
    info!("   Region: {}", config.channel.region);
    info!("   Local peers: {}", config.service.local_peers);
    if config.service.enable_health_server {
        info!("   Health port: {}", config.service.health_port);
    }
    info!(
        "   Handshake: retry {}ms, deadline {}ms, blacklist {}s",
        config.matchmaking.proposal_retry_ms,
        config.matchmaking.proposal_deadline_ms,
        config.matchmaking.blacklist_ttl_seconds
    );
}

/// Load configuration and apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(config_path) => AppConfig::from_file(config_path)?,
        None => AppConfig::from_env()?,
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }
    if args.debug {
        config.service.log_level = "debug".to_string();
    }
    if let Some(amqp_url) = &args.amqp_url {
        config.channel.url = amqp_url.clone();
    }
    if let Some(region) = args.region {
        config.channel.region = region;
    }
    if let Some(peers) = args.peers {
        config.service.local_peers = peers;
    }
    if args.local_bus {
        config.channel.backend = ChannelBackend::Local;
    }
    if let Some(health_port) = args.health_port {
        config.service.health_port = health_port;
    }

    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    let app_state = match AppState::new(config.clone()).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        let _ = app_state.shutdown().await;
        std::process::exit(1);
    }

    let health_task = tokio::spawn(health_check_task(app_state.clone()));

    info!("Roulette Room is running, press Ctrl+C to shut down");

    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("Graceful shutdown completed successfully"),
        Ok(Err(e)) => warn!("Shutdown finished with errors: {}", e),
        Err(_) => warn!("Shutdown timeout exceeded, forcing exit"),
    }

    info!("Roulette Room stopped");
    Ok(())
}
