//! Swarm control server entry point.
//!
//! Wires the components leaves-first: registry, orchestrator, relay manager,
//! gateway, UI acceptor. Relay activity flows to the gateway through one
//! forwarder task, which keeps ingest ordering intact and keeps the manager
//! free of any UI knowledge.

#![allow(dead_code)]

mod config;
mod envelope;
mod fleet;
mod gateway;
mod registry;
mod relay;
mod ws;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::ControlServerConfig;
use crate::fleet::FleetOrchestrator;
use crate::gateway::Gateway;
use crate::registry::CubeRegistry;
use crate::relay::manager::RelayManager;
use crate::ws::WsServer;

#[derive(Debug, Parser)]
#[command(
    name = "swarm-control-server",
    about = "Coordination broker between UI clients and toio cube relays"
)]
struct Args {
    /// Path to the JSON config file.
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let path = config::resolve_config_path(args.config);
    let config = match config::load_config(&path) {
        Ok(config) => config,
        Err(error) => {
            error!(path = %path.display(), %error, "config validation failed");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ControlServerConfig) -> std::io::Result<()> {
    let registry = Arc::new(CubeRegistry::new());
    let fleet = Arc::new(FleetOrchestrator::new(Arc::clone(&registry)));

    let (relay_events_tx, mut relay_events_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(RelayManager::new(Arc::clone(&registry), &config, relay_events_tx));
    let gateway = Arc::new(Gateway::new(
        Arc::new(WsServer::new()),
        Arc::clone(&manager),
        registry,
        fleet,
        config.field,
    ));

    manager.start();
    let forwarder = Arc::clone(&gateway);
    tokio::spawn(async move {
        while let Some(event) = relay_events_rx.recv().await {
            forwarder.publish_relay_event(event);
        }
    });

    let bind = format!("{}:{}", config.ui.host, config.ui.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, relays = config.relays.len(), "control server listening");
    let result = ws::serve(listener, gateway).await;

    manager.stop();
    info!("control server stopped");
    result
}
