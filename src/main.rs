//! relaykit - bidirectional relay proxy
//!
//! Accepts TCP clients and UDP datagrams, applies admission rules, and relays
//! traffic to north endpoints over TCP, TLS or WebSocket. UDP traffic crosses
//! the north link inside a framed stream tunnel.

mod config;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use config::ServiceConfig;
use service::Service;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// relaykit - relay TCP and UDP traffic through filtered tunnels
#[derive(Parser, Debug)]
#[command(name = "relaykit")]
#[command(about = "Relay TCP and UDP traffic through filtered tunnels")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "RELAYKIT_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "RELAYKIT_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = ServiceConfig::load(&cli.config)?;
    info!(
        "relaykit {} starting with {} listener(s)",
        env!("GIT_TAG"),
        config.listeners.len()
    );

    let service = Service::new(config)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = service.run() => {
            if let Err(e) = result {
                error!("Service error: {:#}", e);
                return Err(e);
            }
        }
    }

    info!("relaykit stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
