//! Portbridge - Transparent TCP Port-Forwarding Relay
//!
//! Accepts connections on a bind address and relays each one to a fixed
//! target address, with admission control configured through CIDR
//! allow/deny lists.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portbridge::{config::ConfigManager, Device, ShutdownCoordinator};

/// CLI arguments for portbridge
#[derive(Parser, Debug)]
#[command(name = "portbridge")]
#[command(about = "Transparent TCP port-forwarding relay")]
#[command(version)]
#[command(long_about = "
Portbridge - Transparent TCP Port-Forwarding Relay

Accepts connections on a bind address and relays the byte stream of each
one to a fixed target address.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  PORTBRIDGE_BIND_ADDR              - Bind address (e.g., 127.0.0.1:1080)
  PORTBRIDGE_TARGET_ADDR            - Target address (e.g., 10.0.0.2:8080)
  PORTBRIDGE_ACCEPT_BACKOFF_INITIAL - First delay after a failed accept (e.g., 10ms)
  PORTBRIDGE_ACCEPT_BACKOFF_MAX     - Backoff ceiling (e.g., 1s)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 127.0.0.1:1080)")]
    pub bind: Option<SocketAddr>,

    /// Target address (overrides config file)
    #[arg(short, long, help = "Target address (e.g., 10.0.0.2:8080)")]
    pub target: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    /// Print Prometheus metrics on shutdown
    #[arg(long, help = "Print Prometheus metrics on shutdown")]
    pub dump_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting portbridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(args.bind, args.target);

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Target address: {}", config.server.target_addr);
        info!(
            "  Admission policy: {}",
            if config.admission.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
        return Ok(());
    }

    let device = Arc::new(Device::from_config(&config).await?);
    info!(
        bind_addr = %device.bind_addr(),
        target_addr = %device.target_addr(),
        "listener bound"
    );

    let runner = tokio::spawn(Arc::clone(&device).run());

    let coordinator = ShutdownCoordinator::new();
    coordinator.listen_for_signals().await?;

    info!("Initiating graceful shutdown");
    device.close().await;
    runner.await?;

    let metrics = device.metrics();
    info!(
        relays_opened = metrics.relays_opened(),
        relays_closed = metrics.relays_closed(),
        connections_denied = metrics.connections_denied(),
        dial_failures = metrics.dial_failures(),
        bytes_relayed = metrics.bytes_relayed(),
        "final relay statistics"
    );

    if args.dump_metrics {
        println!("{}", metrics.export());
    }

    info!("Shutdown complete");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
