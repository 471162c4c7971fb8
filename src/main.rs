//! wgproxy main entry point
//!
//! Parses the CLI, sets up logging, loads the configuration and keeps the
//! tunnels running until the process is asked to stop.

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wgproxy::{
    config::DeviceConfig,
    wireguard::{create_ipc_request, LogLevel},
    APP_NAME, VERSION,
};

/// Userspace WireGuard tunnels with one virtual network stack per local address
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/wgproxy/config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "silent")]
    verbose: bool,

    /// Silence device logging
    #[arg(short, long)]
    silent: bool,

    /// Check the configuration and exit
    #[arg(short = 'n', long)]
    configtest: bool,
}

impl Cli {
    fn log_level(&self) -> LogLevel {
        if self.silent {
            LogLevel::Silent
        } else if self.verbose {
            LogLevel::Verbose
        } else {
            LogLevel::Error
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize structured logging with tracing
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let conf = DeviceConfig::from_file(&cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", cli.config, e))?;

    if cli.configtest {
        let setting = create_ipc_request(&conf)?;
        wgproxy::tunnel::plan_tunnels(&conf)?;
        info!(
            "{} peer(s), {} local address(es), {} byte request",
            conf.peers.len(),
            conf.addresses.len(),
            setting.ipc_request().len()
        );
        println!("Config OK");
        return Ok(());
    }

    info!("Starting {} v{} with config: {}", APP_NAME, VERSION, cli.config);

    let tunnels = wgproxy::start_wireguard(Arc::new(conf), cli.log_level())?;
    if tunnels.is_empty() {
        info!("No local addresses configured; nothing to serve");
    }
    for (key, tunnel) in &tunnels {
        let dns = if tunnel.system_dns() {
            "system resolver".to_string()
        } else {
            format!("{:?}", tunnel.tnet().dns_servers())
        };
        info!(
            "Tunnel {} via {} on {} (dns: {})",
            key,
            tunnel.local_address(),
            tunnel.device().name(),
            dns
        );
    }

    shutdown_signal().await?;

    info!("Shutting down {} tunnel(s)", tunnels.len());
    for (_, tunnel) in tunnels {
        tunnel.close();
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    Ok(())
}
