//! # Tunnel agent
//!
//! Connects outbound to a controller's tunnel listener over mTLS, advertises
//! its configured endpoints in a `Hello` frame, and fulfills tunneled HTTP
//! requests against them via a per-endpoint-type executor.
//!
//! ## Modules
//!
//! - [`cli`] / [`config`]       — process startup surface
//! - [`error`]                  — crate-level error taxonomy
//! - `tunnel_protocol` (external crate) — wire frames and codec
//! - [`connect`]                — controller connection loop
//! - [`executors`]              — per-endpoint-type outbound execution

mod cli;
mod config;
mod connect;
mod error;
mod executors;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;

use crate::cli::Cli;
use crate::config::Config;
use crate::executors::ExecutorRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = Config::load(&cli.config_file)
        .with_context(|| format!("loading config from {}", cli.config_file.display()))?;

    let registry = Arc::new(
        ExecutorRegistry::build(&config.endpoints).context("building endpoint executors")?,
    );
    let config = Arc::new(config);

    let connect_registry = registry.clone();
    let connect_task = tokio::spawn(connect::run(config, connect_registry));

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    connect_task.abort();
    registry.cancel_all();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
