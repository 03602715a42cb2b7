//! vizbroker daemon
//!
//! Owns the resource registry and serves allocation requests over REST.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use vizbroker_api::create_router;
use vizbroker_core::BrokerConfig;
use vizbroker_scheduler::Broker;

/// vizbroker daemon - resource broker for visualization clusters
#[derive(Parser, Debug)]
#[command(name = "vizbrokerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/vizbroker/vizbroker.toml")]
    config: PathBuf,

    /// Address to bind the API server, overrides the config file
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server, overrides the config file
    #[arg(long)]
    port: Option<u16>,

    /// Log level, overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn init_logging(level: Level, format: &str) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false);

    if format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("Failed to set subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BrokerConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if let Some(address) = args.address {
        config.api.address = address;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(parse_level(&config.logging.level), &config.logging.format)?;

    info!("Starting vizbroker daemon v{}", env!("CARGO_PKG_VERSION"));

    let broker = Arc::new(Broker::from_config(&config).context("Failed to build broker")?);

    let status = broker.status().await;
    info!(
        nodes = status.nodes,
        resources = status.resources,
        backends = ?status.backends,
        "Registry loaded"
    );
    if !status.unusable_nodes.is_empty() {
        warn!(nodes = ?status.unusable_nodes, "Some nodes are unusable");
    }

    let router = create_router(broker);

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("Invalid address")?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind")?;
    axum::serve(listener, router).await.context("Server error")?;

    Ok(())
}
