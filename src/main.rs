//! MQTT ingest - main entry point

use clap::{Parser, Subcommand};
use mqtt_ingest::config::{IngestMode, ServiceConfig};
use mqtt_ingest::observability::{init_default_logging, lifecycle_span, HealthServer};
use mqtt_ingest::store::JsonLinesStore;
use mqtt_ingest::transport::mqtt::RumqttTransportFactory;
use mqtt_ingest::IngestService;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

/// Supervised MQTT connections with buffered ingestion
#[derive(Parser)]
#[command(name = "mqtt-ingest")]
#[command(about = "Connects MQTT brokers and records every inbound message")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_INGEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured brokers and ingest until interrupted
    Run,
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting mqtt-ingest");

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ServiceConfig::load_from_file(path)?);
    }

    for path_str in ["ingest.toml", "config/ingest.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ServiceConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create ingest.toml".into())
}

async fn run_service(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(JsonLinesStore::new(config.ingest.store_path.clone()));
    let factory = Arc::new(RumqttTransportFactory::new(config.mqtt.clone()));
    let service = Arc::new(IngestService::new(config.clone(), factory, store));
    let shutdown = CancellationToken::new();

    let health_handle = config.health.port.map(|port| {
        let server = Arc::new(HealthServer::new(port, service.clone()));
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(shutdown).await {
                error!("Health server error: {}", e);
            }
        })
    });

    let connected = service
        .connect_configured()
        .instrument(lifecycle_span!(phase = "startup"))
        .await;
    if connected == 0 && !config.brokers.is_empty() {
        error!("No configured broker could be connected; retry with `connect` once brokers are reachable");
    }

    let batch_handle = match config.ingest.mode {
        IngestMode::Continuous => {
            service.start_consumer();
            None
        }
        IngestMode::Batch => {
            let service = service.clone();
            let cancel = shutdown.clone();
            let interval = std::time::Duration::from_secs(config.ingest.batch_interval_secs);
            Some(tokio::spawn(async move {
                service.run_batches(interval, cancel).await
            }))
        }
    };

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(mode = ?config.ingest.mode, "Ingesting, waiting for shutdown signal");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    shutdown.cancel();
    if let Some(handle) = batch_handle {
        if let Err(e) = handle.await {
            error!("Batch loop failed: {}", e);
        }
    }

    service
        .shutdown()
        .instrument(lifecycle_span!(phase = "shutdown"))
        .await;

    if let Some(handle) = health_handle {
        if let Err(e) = handle.await {
            error!("Health server task failed: {}", e);
        }
    }
    Ok(())
}

fn handle_config_command(
    config: ServiceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    for broker in &config.brokers {
        broker.to_broker_config()?;
    }

    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!(brokers = config.brokers.len(), "Configuration is valid");
    Ok(())
}
