//! Digital Human Heartbeat Server
//!
//! WebSocket liveness endpoint for digital human clients. Clients keep their
//! connection validated by sending `ping` and receiving `pong`.

mod config;
mod registry;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::Settings;
use server::{ServerConfig, WebSocketServer};

/// Digital Human Heartbeat Server
///
/// WebSocket ping/pong liveness endpoint
#[derive(Parser, Debug)]
#[command(name = "dh-heartbeat")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides the settings file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the settings file)
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG takes precedence over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Digital Human Heartbeat v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = match &args.config {
        Some(path) => {
            info!("Loading settings from {}", path.display());
            Settings::load(path)?
        }
        None => Settings::default(),
    };
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }
    if let Some(secs) = args.idle_timeout {
        settings.server.idle_timeout_secs = Some(secs);
    }

    let config = ServerConfig::from(&settings.server);
    if let Some(timeout) = config.idle_timeout {
        info!("Idle timeout enabled: {}s", timeout.as_secs());
    }

    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        wait_for_stop_signal().await;
        server_handle.shutdown();
    });

    server.run().await?;

    info!("All heartbeat connections closed, exiting");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM. A signal that cannot be installed
/// is logged and never fires.
async fn wait_for_stop_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Interrupted, closing heartbeat connections"),
        _ = terminate => info!("Terminated, closing heartbeat connections"),
    }
}
