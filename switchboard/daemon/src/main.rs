//! Switchboard Daemon - Routing Engine Server
//!
//! Hosts the switchboard engine behind a Unix socket. Clients speak the
//! binary frame protocol; adapters come from the configuration file.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! switchboard-daemon
//!
//! # Custom socket path
//! switchboard-daemon --socket-path /tmp/switchboard.sock
//!
//! # With config file
//! switchboard-daemon --config ~/.config/switchboard/config.toml
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use switchboard_core::{load_config_from_path, ConfigOverrides};

use server::DaemonServer;

/// Switchboard Daemon - routing and flow control for language-model adapters
#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Environment variable holding the frame signing key
    #[arg(long, value_name = "VAR")]
    signing_key_env: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, value_name = "MS")]
    heartbeat_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(path) = &self.socket_path {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(var) = &self.signing_key_env {
            overrides = overrides.with_signing_key_env(var.clone());
        }
        if let Some(ms) = self.heartbeat_ms {
            overrides = overrides.with_heartbeat_ms(ms);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_daemon={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Switchboard Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        socket_path = ?config.socket_path,
        adapters = config.adapters.len(),
        rules = config.rules.len(),
        "Configuration loaded"
    );
    if let Some(ref path) = config.config_file_path {
        info!(config_path = ?path, "Config file");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let mut server = DaemonServer::new(config);
    match server.run(shutdown).await {
        Ok(()) => {
            info!("Switchboard Daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Switchboard Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_become_overrides() {
        let args = Args::parse_from([
            "switchboard-daemon",
            "--socket-path",
            "/tmp/sb.sock",
            "--heartbeat-ms",
            "500",
        ]);
        let mut config = switchboard_core::SwitchboardConfig::default();
        args.overrides().apply(&mut config);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/sb.sock"));
        assert_eq!(
            config.session.heartbeat_interval,
            std::time::Duration::from_millis(500)
        );
    }
}
