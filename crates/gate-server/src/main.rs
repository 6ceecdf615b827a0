//! gate-server: WebSocket frontend gate.
//!
//! Terminates client WebSocket connections, keeps per-channel auth
//! sessions, and bridges traffic to backend services over the internal
//! RPC bus.

mod bus;
mod config;
mod gateway;
mod router;

use bus::nats::NatsBus;
use clap::Parser;
use config::GateConfig;
use gateway::listener::GateListener;
use gateway::registry::ConnectionRegistry;
use router::SessionRouter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// gate-server — WebSocket frontend gate
#[derive(Parser, Debug)]
#[command(name = "gate-server", version, about = "WebSocket frontend gate")]
struct Cli {
    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.gate/config.toml")]
    config: String,

    /// Liveness probe interval in seconds
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Bus server URL
    #[arg(long)]
    bus_url: Option<String>,

    /// Skip the auth handshake on connect
    #[arg(long)]
    disable_auth: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting gate-server"
    );

    // Load config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match GateConfig::load(
        Some(&config_path),
        cli.host,
        cli.port,
        cli.ping_interval,
        cli.bus_url,
        cli.disable_auth,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Connect to the bus
    let nats = match NatsBus::connect(&config.bus_url).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            error!(error = %e, "failed to connect to bus");
            std::process::exit(1);
        }
    };

    let router = Arc::new(SessionRouter::new(nats.clone(), &config));

    // Serve the gate's inbound routes (transfer, checkChannel, checkChannels)
    if let Err(e) = nats.serve_routes(&config.gate_prefix, router.clone()).await {
        error!(error = %e, "failed to serve inbound routes");
        std::process::exit(1);
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let listener = Arc::new(GateListener::new(
        registry,
        router,
        Duration::from_secs(config.ping_interval_secs),
    ));

    // Run until shutdown signal
    tokio::select! {
        result = listener.run(&config.host, config.port) => {
            if let Err(e) = result {
                error!(error = %e, "gate error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("gate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
