//! relay-mesh CLI
//!
//! Command-line interface for running a relay-mesh client.

use clap::{Parser, Subcommand};
use std::env;
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relay_mesh::{
    normalize_relay_url, ClientConfig, RelayClient, RelayMode, Result, Timer, Transport,
    WsTransport, WsTransportConfig,
};

const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "relay-mesh")]
#[command(author, version, about = "Relay resilience and caching client", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay-mesh.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "relay-mesh.toml")]
        output: String,
    },

    /// Connect to relays and keep them healthy until Ctrl+C
    Run {
        /// Extra relay to add (repeatable)
        #[arg(short, long = "relay")]
        relays: Vec<String>,

        /// Seconds between status reports
        #[arg(long, default_value_t = DEFAULT_STATUS_INTERVAL_SECS)]
        status_interval: u64,

        /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9464)
        #[arg(long)]
        metrics_addr: Option<String>,
    },

    /// Check whether a relay accepts WebSocket connections
    Probe {
        /// Relay URL
        url: String,

        /// Probe deadline in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    let value = env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let value = env_string(name)?;
    match parse_env_bool(&value) {
        Some(parsed) => Some(parsed),
        None => {
            warn!("Invalid value for {}: {}", name, value);
            None
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let value = env_string(name)?;
    match value.parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Invalid value for {}: {}", name, value);
            None
        }
    }
}

fn env_csv(name: &str) -> Option<Vec<String>> {
    let value = env_string(name)?;
    let values: Vec<String> = value
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn apply_env_overrides(config: &mut ClientConfig) {
    if let Some(relays) = env_csv("RELAY_MESH_DEFAULT_RELAYS") {
        config.relays.default_relays = relays;
    }
    if let Some(relays) = env_csv("RELAY_MESH_USER_RELAYS") {
        config.relays.user_relays = relays;
    }

    if let Some(timeout) = env_u64("RELAY_MESH_CONNECT_TIMEOUT_MS") {
        config.connection.connect_timeout_ms = timeout;
    }
    if let Some(retries) = env_u64("RELAY_MESH_MAX_RETRIES") {
        config.connection.max_retries = retries.min(u32::MAX as u64) as u32;
    }
    if let Some(interval) = env_u64("RELAY_MESH_HEALTH_INTERVAL_SECS") {
        config.health.interval_secs = interval;
    }

    if let Some(enabled) = env_bool("RELAY_MESH_PERSISTENCE") {
        config.persistence.enabled = enabled;
    }
    if let Some(data_dir) = env_string("RELAY_MESH_DATA_DIR") {
        config.persistence.data_dir = data_dir;
    }
    if let Some(quota) = env_u64("RELAY_MESH_QUOTA_BYTES") {
        config.persistence.quota_bytes = quota;
    }

    if let Some(enabled) = env_bool("RELAY_MESH_METRICS") {
        config.metrics.enabled = enabled;
    }
    if let Some(addr) = env_string("RELAY_MESH_METRICS_ADDR") {
        config.metrics.listen_address = Some(addr);
    }
}

fn load_config(path: &str) -> Result<ClientConfig> {
    let mut config = if Path::new(path).exists() {
        info!("Loading configuration from: {}", path);
        ClientConfig::load(path)?
    } else {
        info!("Using default configuration");
        ClientConfig::default()
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn report_status(client: &RelayClient) {
    let connected = client.get_connected_relay_urls();
    let stats = client.cache().get_cache_stats();
    info!(
        "{} relays connected, {} cached entries, storage {}/{} bytes ({:?})",
        connected.len(),
        stats.total_entries(),
        stats.used_bytes,
        stats.quota_bytes,
        stats.quota_level
    );
    for record in client.get_relay_status() {
        info!(
            "  {} {:?} score={:.1} failures={}",
            record.url, record.status, record.score, record.failure_count
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Init { output } => {
            info!("Writing default configuration to: {}", output);
            let config = ClientConfig::default();
            config.save(&output)?;
            info!("Configuration saved successfully");
        }

        Commands::Run {
            relays,
            status_interval,
            metrics_addr,
        } => {
            info!("Starting relay-mesh client...");
            let mut config = load_config(&cli.config)?;
            if metrics_addr.is_some() {
                config.metrics.listen_address = metrics_addr;
            }
            let listen_address = config.metrics.listen_address.clone();
            let client = RelayClient::from_config(config)?;

            if let Some(addr) = listen_address {
                if client.metrics().is_enabled() {
                    let listener = tokio::net::TcpListener::bind(&addr).await?;
                    let service = client.metrics().clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay_mesh::metrics::serve(listener, service).await {
                            error!("Metrics server failed: {}", e);
                        }
                    });
                } else {
                    warn!("Metrics are disabled, not serving {}", addr);
                }
            }

            let connected = client.start().await;
            info!("Connected to {} relays", connected);

            for relay in &relays {
                if client.add_relay(relay, RelayMode::READ_WRITE).await {
                    info!("Added relay {}", relay);
                } else {
                    warn!("Could not connect to {}", relay);
                }
            }

            info!("Press Ctrl+C to stop");
            let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => report_status(&client),

                    _ = signal::ctrl_c() => {
                        info!("Received shutdown signal");
                        client.shutdown().await;
                        info!("Client stopped");
                        break;
                    }
                }
            }
        }

        Commands::Probe { url, timeout } => {
            let url = normalize_relay_url(&url)?;
            let transport = WsTransport::new(WsTransportConfig {
                connect_timeout: Duration::from_secs(timeout),
                ..Default::default()
            });

            info!("Probing {}", url);
            let timer = Timer::start();
            match tokio::time::timeout(Duration::from_secs(timeout), transport.probe(&url)).await {
                Ok(Ok(())) => {
                    info!("{} is reachable ({} ms)", url, timer.elapsed_ms());
                }
                Ok(Err(e)) => {
                    error!("Probe failed: {}", e);
                    std::process::exit(1);
                }
                Err(_) => {
                    error!("Probe timed out");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
