//! # Endpoint executors
//!
//! Dispatches a decoded `OpenHttpTunnelRequest` to the executor registered
//! for its endpoint name and streams the result back as response frames.
//! Three built-in kinds exist (§4.7); each is a trait object behind a
//! registry keyed by type string at build time, not a type hierarchy (§9).

pub mod aws;
pub mod http;
pub mod kubernetes;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tunnel_protocol::{
    Frame, HttpHeader, HttpTunnelChunkedResponse, HttpTunnelResponse, OpenHttpTunnelRequest,
    TunnelControl,
};

use crate::config::EndpointConfig;
use crate::error::Error;

/// One chunk's worth of streaming, matching the reference crate's
/// convention of bounding outbound writes rather than copying a whole
/// response body into memory at once.
pub const CHUNK_SIZE: usize = 10 * 1024;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Performs the tunneled request and writes its own response frames to
    /// `responder`. Must observe `cancel` and stop promptly when tripped.
    async fn execute(
        &self,
        request: OpenHttpTunnelRequest,
        responder: Responder,
        cancel: CancellationToken,
    );
}

/// Writes response frames for one transaction id, in the
/// `HttpTunnelResponse` then `HttpTunnelChunkedResponse*` then
/// empty-chunk order the protocol requires (§4.4 ordering guarantee).
#[derive(Clone)]
pub struct Responder {
    id: String,
    outbound_tx: mpsc::Sender<Frame>,
}

impl Responder {
    fn new(id: String, outbound_tx: mpsc::Sender<Frame>) -> Self {
        Self { id, outbound_tx }
    }

    pub async fn respond(&self, status: u16, headers: Vec<HttpHeader>, content_length: Option<u64>) {
        let frame = Frame::Tunnel(TunnelControl::HttpTunnelResponse(HttpTunnelResponse {
            id: self.id.clone(),
            status,
            headers,
            content_length,
        }));
        let _ = self.outbound_tx.send(frame).await;
    }

    pub async fn send_chunk(&self, body: Vec<u8>) {
        let frame = Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(
            HttpTunnelChunkedResponse {
                id: self.id.clone(),
                body,
            },
        ));
        let _ = self.outbound_tx.send(frame).await;
    }

    pub async fn finish(&self) {
        self.send_chunk(Vec::new()).await;
    }

    /// Synthesizes a bodiless error response for executor-side failures
    /// (§4.8: executor HTTP error → synthesized 502 response frame).
    pub async fn respond_error(&self, status: u16) {
        self.respond(status, vec![], Some(0)).await;
        self.finish().await;
    }
}

type Factory = fn(&EndpointConfig) -> Result<Arc<dyn Executor>, Error>;

fn factories() -> HashMap<&'static str, Factory> {
    let mut map: HashMap<&'static str, Factory> = HashMap::new();
    map.insert("kubernetes", kubernetes::build);
    map.insert("aws", aws::build);
    map.insert("http", http::build);
    map
}

/// Holds one executor instance per configured endpoint *name* (credentials
/// differ per instance even when the type string is shared), plus the
/// in-flight transaction cancellation map.
pub struct ExecutorRegistry {
    by_name: HashMap<String, Arc<dyn Executor>>,
    cancels: DashMap<String, CancellationToken>,
}

impl ExecutorRegistry {
    pub fn build(endpoints: &[EndpointConfig]) -> Result<Self, Error> {
        let factories = factories();
        let mut by_name = HashMap::new();
        for cfg in endpoints {
            let factory = factories
                .get(cfg.endpoint_type())
                .ok_or_else(|| Error::UnknownEndpointType(cfg.endpoint_type().to_string()))?;
            by_name.insert(cfg.name().to_string(), factory(cfg)?);
        }
        Ok(Self {
            by_name,
            cancels: DashMap::new(),
        })
    }

    /// Spawns the executor for `request.name`, or synthesizes a `502` if no
    /// endpoint by that name is configured on this agent.
    pub fn spawn(self: &Arc<Self>, request: OpenHttpTunnelRequest, outbound_tx: mpsc::Sender<Frame>) {
        let id = request.id.clone();
        let Some(executor) = self.by_name.get(&request.name).cloned() else {
            warn!(transaction_id = %id, name = %request.name, "no endpoint configured by that name");
            let responder = Responder::new(id, outbound_tx);
            tokio::spawn(async move { responder.respond_error(502).await });
            return;
        };

        let cancel = CancellationToken::new();
        self.cancels.insert(id.clone(), cancel.clone());
        let registry = self.clone();
        tokio::spawn(async move {
            let responder = Responder::new(id.clone(), outbound_tx);
            executor.execute(request, responder, cancel).await;
            registry.cancels.remove(&id);
        });
    }

    /// Cancels the named transaction if still in flight; unknown ids are a
    /// no-op (§8 round-trip property).
    pub fn cancel(&self, id: &str) {
        match self.cancels.remove(id) {
            Some((_, token)) => token.cancel(),
            None => warn!(transaction_id = id, "cancel: no such transaction"),
        }
    }

    /// Cancels every in-flight transaction, used when the session drops
    /// (§4.4 Draining: outstanding transactions are cancelled).
    pub fn cancel_all(&self) {
        for entry in self.cancels.iter() {
            entry.value().cancel();
        }
        self.cancels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_registers_one_executor_per_endpoint_name() {
        let endpoints = vec![EndpointConfig::Http {
            name: "jenkins".to_string(),
            configured: true,
            base_url: "https://jenkins.internal".to_string(),
            bearer_token: None,
            basic_auth: None,
        }];
        let registry = ExecutorRegistry::build(&endpoints).unwrap();
        assert_eq!(registry.by_name.len(), 1);
        assert!(registry.by_name.contains_key("jenkins"));
    }

    #[tokio::test]
    async fn spawn_synthesizes_a_502_for_an_unconfigured_name() {
        let registry = Arc::new(ExecutorRegistry::build(&[]).unwrap());
        let (tx, mut rx) = mpsc::channel(4);
        let request = OpenHttpTunnelRequest {
            id: "txn-1".to_string(),
            name: "no-such-endpoint".to_string(),
            endpoint_type: "http".to_string(),
            method: "GET".to_string(),
            uri: "/".to_string(),
            headers: vec![],
            body: vec![],
        };

        registry.spawn(request, tx);

        let Frame::Tunnel(TunnelControl::HttpTunnelResponse(resp)) = rx.recv().await.unwrap()
        else {
            panic!("expected HttpTunnelResponse");
        };
        assert_eq!(resp.status, 502);
    }

    #[test]
    fn cancel_of_an_unknown_id_is_a_no_op() {
        let registry = ExecutorRegistry::build(&[]).unwrap();
        registry.cancel("does-not-exist");
    }

    #[test]
    fn cancel_all_clears_every_tracked_transaction() {
        let registry = ExecutorRegistry::build(&[]).unwrap();
        registry.cancels.insert("a".to_string(), CancellationToken::new());
        registry.cancels.insert("b".to_string(), CancellationToken::new());
        registry.cancel_all();
        assert!(registry.cancels.is_empty());
    }
}
