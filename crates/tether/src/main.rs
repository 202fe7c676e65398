//! # tether
//!
//! Server binary: loads settings, installs logging and metrics, and serves
//! the room-chat handler until ctrl-c.

#![deny(unsafe_code)]

mod room;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_server::{Dispatcher, TetherServer};
use tether_settings::TetherSettings;

use crate::room::RoomChat;

/// Tether WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tether WebSocket connection server")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args
        .settings
        .clone()
        .unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    tether_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = match tether_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let dispatcher = Dispatcher::new(settings, |_| RoomChat);
    let mut server = TetherServer::new(dispatcher);
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let handle = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Tether listening on ws://{}", handle.addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let closed = handle.shutdown(None).await;
    tracing::info!(closed, "Shutdown complete");
    Ok(())
}
