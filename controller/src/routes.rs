//! # Route table
//!
//! Holds the live agent sessions, keyed by agent name, and answers lookups
//! of `(agent-name, endpoint-type, endpoint-name)` with a uniformly-selected
//! live session. A single `tokio::sync::RwLock` guards the map: readers
//! (lookups) take the read side, `add`/`remove` take the write side. The
//! lock is never held across a channel send — sends go out while only
//! holding the read guard, and the channel itself absorbs bursts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use tunnel_protocol::{Endpoint, Frame};

use crate::error::Error;
use crate::health::Metrics;
use crate::transactions::TransactionRegistry;

/// Per-route counters, serialized as part of the CNC `/statistics` contract.
#[derive(Debug, Default)]
pub struct RouteStatistics {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub transactions_opened: AtomicU64,
}

impl RouteStatistics {
    pub fn snapshot(&self) -> RouteStatisticsSnapshot {
        RouteStatisticsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            transactions_opened: self.transactions_opened.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteStatisticsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub transactions_opened: u64,
}

/// A live agent session: everything the route table and the HTTP ingress
/// adapter need in order to address it.
pub struct Route {
    pub name: String,
    pub session_id: String,
    pub connection_type: &'static str,
    pub endpoints: Vec<Endpoint>,
    pub version: String,
    pub hostname: String,
    pub send_tx: mpsc::Sender<Frame>,
    pub statistics: RouteStatistics,
    /// Transaction ids currently open on this route, tracked so that
    /// `RouteTable::remove` can cancel them when the session drains.
    transactions: DashMap<String, ()>,
}

impl Route {
    pub fn new(
        name: String,
        endpoints: Vec<Endpoint>,
        version: String,
        hostname: String,
        send_tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            name,
            session_id: uuid::Uuid::new_v4().to_string(),
            connection_type: "direct",
            endpoints,
            version,
            hostname,
            send_tx,
            statistics: RouteStatistics::default(),
            transactions: DashMap::new(),
        }
    }

    /// True if this route advertises a *configured* endpoint matching the
    /// search. Unconfigured endpoints are never eligible (§3 route table).
    fn matches(&self, endpoint_type: &str, endpoint_name: &str) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.configured && e.endpoint_type == endpoint_type && e.name == endpoint_name)
    }
}

/// Looks up `(agent name, endpoint type, endpoint name)`.
#[derive(Debug, Clone)]
pub struct Search {
    pub name: String,
    pub endpoint_type: String,
    pub endpoint_name: String,
    /// When set, `cancel` is restricted to the route with this session id
    /// (§4.3: cancel requires `search.session_id` to be set).
    pub session_id: Option<String>,
}

#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Vec<Arc<Route>>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, route: Arc<Route>) {
        let mut routes = self.routes.write().await;
        let slice = routes.entry(route.name.clone()).or_default();
        info!(
            agent = %route.name,
            session_id = %route.session_id,
            endpoints = route.endpoints.len(),
            "route added"
        );
        slice.push(route);
    }

    /// Removes exactly the route matching `session_id` from its agent's
    /// slice (swap-with-last-then-truncate), cancelling any transactions
    /// still open on it. A missing entry is logged, not fatal — §4.3.
    pub async fn remove(&self, name: &str, session_id: &str, registry: &TransactionRegistry) {
        let mut routes = self.routes.write().await;
        let Some(slice) = routes.get_mut(name) else {
            warn!(agent = name, session_id, "remove: no routes for agent");
            return;
        };
        if let Some(pos) = slice.iter().position(|r| r.session_id == session_id) {
            let route = slice.swap_remove(pos);
            info!(agent = name, session_id, "route removed");
            for entry in route.transactions.iter() {
                registry.cancel(entry.key());
            }
            if slice.is_empty() {
                routes.remove(name);
            }
        } else {
            warn!(agent = name, session_id, "remove: session not found");
        }
    }

    /// Returns the subset of an agent's routes carrying a `configured=true`
    /// endpoint matching `(endpoint_type, endpoint_name)`.
    async fn candidates(&self, search: &Search) -> Vec<Arc<Route>> {
        let routes = self.routes.read().await;
        routes
            .get(&search.name)
            .map(|slice| {
                slice
                    .iter()
                    .filter(|r| r.matches(&search.endpoint_type, &search.endpoint_name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Picks uniformly among the live candidates and hands `message` to its
    /// send channel, returning the chosen session id. The read lock is
    /// dropped before the (non-blocking) send; a full channel yields
    /// `Backpressure` instead of stalling the table. When `transaction_id`
    /// is set, it is tracked against the chosen route so a later session
    /// drain can cancel it (§4.4 Draining).
    pub async fn send(
        &self,
        search: &Search,
        transaction_id: Option<&str>,
        message: Frame,
        metrics: &Metrics,
    ) -> Result<String, Error> {
        let candidates = self.candidates(search).await;
        if candidates.is_empty() {
            return Err(Error::NoRoute(search.name.clone()));
        }
        let chosen = {
            let idx = rand::thread_rng().gen_range(0..candidates.len());
            candidates[idx].clone()
        };
        chosen
            .send_tx
            .try_send(message)
            .map_err(|_| Error::Backpressure(chosen.session_id.clone()))?;
        chosen
            .statistics
            .frames_sent
            .fetch_add(1, Ordering::Relaxed);
        metrics.frames_sent.inc();
        if let Some(id) = transaction_id {
            chosen.transactions.insert(id.to_string(), ());
        }
        Ok(chosen.session_id.clone())
    }

    /// Stops tracking a transaction against the named route once it
    /// finishes normally (so a later drain does not try to cancel it).
    pub async fn untrack_transaction(&self, name: &str, session_id: &str, transaction_id: &str) {
        let routes = self.routes.read().await;
        if let Some(slice) = routes.get(name) {
            if let Some(route) = slice.iter().find(|r| r.session_id == session_id) {
                route.transactions.remove(transaction_id);
            }
        }
    }

    /// Delivers a cancellation to the one route named by `search.session_id`.
    pub async fn cancel(&self, search: &Search, frame: Frame) {
        let Some(session_id) = &search.session_id else {
            warn!("cancel called without a session_id in the search");
            return;
        };
        let routes = self.routes.read().await;
        if let Some(slice) = routes.get(&search.name) {
            if let Some(route) = slice.iter().find(|r| &r.session_id == session_id) {
                let _ = route.send_tx.try_send(frame);
            }
        }
    }

    pub async fn statistics(&self) -> HashMap<String, Vec<RouteStatisticsSnapshot>> {
        let routes = self.routes.read().await;
        routes
            .iter()
            .map(|(name, slice)| {
                (
                    name.clone(),
                    slice.iter().map(|r| r.statistics.snapshot()).collect(),
                )
            })
            .collect()
    }

    pub async fn route_count(&self, name: &str) -> usize {
        self.routes
            .read()
            .await
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::Endpoint;

    fn endpoint(name: &str, ty: &str, configured: bool) -> Endpoint {
        Endpoint {
            name: name.into(),
            endpoint_type: ty.into(),
            configured,
            namespaces: vec![],
            account_id: None,
            assume_role: None,
            annotations: vec![],
        }
    }

    async fn route_with(endpoints: Vec<Endpoint>) -> (Arc<Route>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(20_000);
        let route = Arc::new(Route::new(
            "a1".into(),
            endpoints,
            "1.0".into(),
            "host".into(),
            tx,
        ));
        (route, rx)
    }

    #[tokio::test]
    async fn add_then_remove_restores_prior_state() {
        let table = RouteTable::new();
        let registry = TransactionRegistry::new();
        let (route, _rx) = route_with(vec![endpoint("prod", "kubernetes", true)]).await;
        let session_id = route.session_id.clone();
        table.add(route).await;
        assert_eq!(table.route_count("a1").await, 1);
        table.remove("a1", &session_id, &registry).await;
        assert_eq!(table.route_count("a1").await, 0);
    }

    #[tokio::test]
    async fn remove_missing_route_is_a_noop() {
        let table = RouteTable::new();
        let registry = TransactionRegistry::new();
        table.remove("ghost", "nope", &registry).await;
        assert_eq!(table.route_count("ghost").await, 0);
    }

    #[tokio::test]
    async fn unconfigured_endpoint_is_excluded_from_selection() {
        let table = RouteTable::new();
        let (route, _rx) = route_with(vec![endpoint("prod", "kubernetes", false)]).await;
        table.add(route).await;

        let search = Search {
            name: "a1".into(),
            endpoint_type: "kubernetes".into(),
            endpoint_name: "prod".into(),
            session_id: None,
        };
        let err = table
            .send(&search, None, Frame::Ping { ts: 0 }, &Metrics::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRoute(_)));
    }

    #[tokio::test]
    async fn send_returns_a_session_that_existed_at_selection() {
        let table = RouteTable::new();
        let (route, mut rx) = route_with(vec![endpoint("prod", "kubernetes", true)]).await;
        let session_id = route.session_id.clone();
        table.add(route).await;

        let search = Search {
            name: "a1".into(),
            endpoint_type: "kubernetes".into(),
            endpoint_name: "prod".into(),
            session_id: None,
        };
        let got = table
            .send(&search, None, Frame::Ping { ts: 7 }, &Metrics::new())
            .await
            .unwrap();
        assert_eq!(got, session_id);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn selection_is_roughly_uniform_across_three_candidates() {
        let table = RouteTable::new();
        let mut session_ids = vec![];
        let mut receivers = vec![];
        for _ in 0..3 {
            let (route, rx) = route_with(vec![endpoint("prod", "kubernetes", true)]).await;
            session_ids.push(route.session_id.clone());
            table.add(route).await;
            receivers.push(rx);
        }

        let search = Search {
            name: "a1".into(),
            endpoint_type: "kubernetes".into(),
            endpoint_name: "prod".into(),
            session_id: None,
        };

        let metrics = Metrics::new();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..9000 {
            let chosen = table
                .send(&search, None, Frame::Ping { ts: 0 }, &metrics)
                .await
                .unwrap();
            *counts.entry(chosen).or_default() += 1;
        }

        // Expected 3000 +/- 3 sigma (sigma ~ sqrt(9000 * 1/3 * 2/3) ~ 44.7)
        for sid in session_ids {
            let count = *counts.get(&sid).unwrap_or(&0) as i64;
            assert!(
                (2850..3150).contains(&count),
                "session {sid} got {count} draws, expected near 3000"
            );
        }
    }
}
