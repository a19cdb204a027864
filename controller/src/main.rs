//! # Tunnel controller
//!
//! Accepts inbound HTTP on the services port and forwards it over mTLS
//! tunnel streams to remote agents; exposes the CNC REST surface contract
//! types for interop (no CA logic), and a Prometheus health/metrics port.
//!
//! ## Modules
//!
//! - [`cli`] / [`config`] — process startup surface
//! - [`error`]             — crate-level error taxonomy
//! - `tunnel_protocol` (external crate) — wire frames and codec
//! - [`tunnel_server`]     — mTLS accept loop for agent streams
//! - [`session`]           — per-agent session state machine
//! - [`routes`]            — live route table
//! - [`transactions`]      — in-flight transaction registry
//! - [`ingress`]           — HTTP-to-tunnel adapter
//! - [`serviceauth`]       — HS256 keyset for `x-tunnel-auth`
//! - [`health`]            — `/`, `/health`, `/metrics`
//! - [`cnc_contract`]      — CNC wire-shape types, no CA logic

mod cli;
mod cnc_contract;
mod config;
mod error;
mod health;
mod ingress;
mod routes;
mod serviceauth;
mod session;
mod transactions;
mod tunnel_server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::Config;
use crate::health::{HealthState, Metrics};
use crate::ingress::IngressState;
use crate::routes::RouteTable;
use crate::serviceauth::KeySet;
use crate::transactions::TransactionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_controller=info".into()),
        )
        .init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = Config::load(&cli.config_file)
        .with_context(|| format!("loading config from {}", cli.config_file.display()))?;

    if config.insecure_agent_connections {
        warn!("insecureAgentConnections is enabled: agents may connect without mTLS");
    }

    let route_table = Arc::new(RouteTable::new());
    let registry = Arc::new(TransactionRegistry::new());
    let keyset = Arc::new(
        KeySet::load(&config.service_auth).context("loading service-auth keyset")?,
    );
    let metrics = Arc::new(Metrics::new());

    let tls_config = if config.insecure_agent_connections {
        None
    } else {
        Some(
            tunnel_server::build_tls_config(&config.ca_config)
                .context("building tunnel listener TLS config")?,
        )
    };

    let tunnel_addr = SocketAddr::from(([0, 0, 0, 0], config.agent_advertise_port));
    let tunnel_route_table = route_table.clone();
    let tunnel_registry = registry.clone();
    let tunnel_metrics = metrics.clone();
    let insecure = config.insecure_agent_connections;
    let tunnel_task = tokio::spawn(async move {
        if let Err(e) = tunnel_server::run(
            tunnel_addr,
            tls_config,
            insecure,
            tunnel_route_table,
            tunnel_registry,
            tunnel_metrics,
        )
        .await
        {
            tracing::error!(error = %e, "tunnel listener exited");
        }
    });

    let ingress_state = IngressState {
        route_table: route_table.clone(),
        registry: registry.clone(),
        keyset,
        metrics: metrics.clone(),
    };
    let ingress_addr = SocketAddr::from(([0, 0, 0, 0], config.service_listen_port));
    let ingress_router = ingress::router(ingress_state);
    let ingress_listener = tokio::net::TcpListener::bind(ingress_addr)
        .await
        .with_context(|| format!("binding ingress listener on {ingress_addr}"))?;
    info!(%ingress_addr, "ingress listener bound");
    let ingress_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(ingress_listener, ingress_router).await {
            tracing::error!(error = %e, "ingress listener exited");
        }
    });

    let health_state = HealthState {
        metrics: metrics.clone(),
    };
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.prometheus_listen_port));
    let health_router = health::router(health_state);
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("binding health listener on {health_addr}"))?;
    info!(%health_addr, "health listener bound");
    let health_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(health_listener, health_router).await {
            tracing::error!(error = %e, "health listener exited");
        }
    });

    let metrics_route_table = route_table.clone();
    let metrics_refresh_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            health::refresh_route_counts(&metrics, &metrics_route_table).await;
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, stopping listeners");
    tunnel_task.abort();
    ingress_task.abort();
    health_task.abort();
    metrics_refresh_task.abort();

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
