//! # Health & metrics surface
//!
//! Bound on `prometheusListenPort`. `/` and `/health` are liveness checks
//! for orchestrators; `/metrics` renders the process's `prometheus`
//! registry in the text exposition format.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntGaugeVec, Registry, TextEncoder};

use crate::routes::RouteTable;

pub struct Metrics {
    pub registry: Registry,
    pub route_count: IntGaugeVec,
    pub open_transactions: prometheus::IntGauge,
    pub frames_sent: prometheus::IntCounter,
    pub frames_received: prometheus::IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let route_count = IntGaugeVec::new(
            prometheus::Opts::new("tunnel_route_count", "live routes per agent name"),
            &["agent"],
        )
        .expect("static metric definition");
        let open_transactions = prometheus::IntGauge::new(
            "tunnel_open_transactions",
            "transactions currently registered",
        )
        .expect("static metric definition");
        let frames_sent =
            prometheus::IntCounter::new("tunnel_frames_sent_total", "frames sent to agents")
                .expect("static metric definition");
        let frames_received = prometheus::IntCounter::new(
            "tunnel_frames_received_total",
            "frames received from agents",
        )
        .expect("static metric definition");

        registry
            .register(Box::new(route_count.clone()))
            .expect("single registration at startup");
        registry
            .register(Box::new(open_transactions.clone()))
            .expect("single registration at startup");
        registry
            .register(Box::new(frames_sent.clone()))
            .expect("single registration at startup");
        registry
            .register(Box::new(frames_received.clone()))
            .expect("single registration at startup");

        Self {
            registry,
            route_count,
            open_transactions,
            frames_sent,
            frames_received,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<Metrics>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(ok_json))
        .route("/health", get(ok_json))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn ok_json() -> impl IntoResponse {
    axum::Json(serde_json::json!({}))
}

async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::error!(error = %e, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8(buf).unwrap_or_default(),
    )
}

/// Refreshes the per-agent route-count gauge from the live table. Called
/// periodically rather than on every add/remove to keep the hot path free
/// of metrics-registry locking.
pub async fn refresh_route_counts(metrics: &Metrics, route_table: &RouteTable) {
    metrics.route_count.reset();
    for (name, snapshots) in route_table.statistics().await {
        metrics
            .route_count
            .with_label_values(&[&name])
            .set(snapshots.len() as i64);
    }
}
