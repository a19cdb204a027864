//! # HTTP ingress adapter
//!
//! Turns one inbound HTTP request into one tunnel transaction (§4.6).
//! Authentication accepts either a signed `x-tunnel-auth` JWT or a
//! `/_services/{agent}/{type}/{name}/...` URL prefix — the latter restores
//! a routing path present in the fabric's lineage but dropped by the
//! original distillation (SPEC_FULL §1).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tunnel_protocol::{Frame, HttpHeader, OpenHttpTunnelRequest, TunnelControl};

use crate::error::Error;
use crate::health::Metrics;
use crate::routes::{RouteTable, Search};
use crate::serviceauth::KeySet;
use crate::transactions::SharedRegistry;

#[derive(Clone)]
pub struct IngressState {
    pub route_table: Arc<RouteTable>,
    pub registry: SharedRegistry,
    pub keyset: Arc<KeySet>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .fallback(axum::routing::any(handle))
        .with_state(state)
}

async fn handle(State(state): State<IngressState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let search = match authenticate(&parts.uri, &parts.headers, &state.keyset) {
        Ok(search) => search,
        Err(e) => {
            warn!(error = %e, "ingress authentication failed");
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to buffer request body");
            return (StatusCode::BAD_REQUEST, "bad request body").into_response();
        }
    };

    let transaction_id = uuid::Uuid::new_v4().to_string();
    let headers = parts
        .headers
        .keys()
        .map(|name| HttpHeader {
            name: name.as_str().to_string(),
            values: parts
                .headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap_or_default().to_string())
                .collect(),
        })
        .collect();

    let request = OpenHttpTunnelRequest {
        id: transaction_id.clone(),
        name: search.name.clone(),
        endpoint_type: search.endpoint_type.clone(),
        method: parts.method.as_str().to_string(),
        uri: strip_prefix_and_host(&parts.uri, &search),
        headers,
        body: body.to_vec(),
    };

    let cancel_token = CancellationToken::new();
    let (response_tx, response_rx) = mpsc::channel::<TunnelControl>(64);
    state
        .registry
        .register(transaction_id.clone(), cancel_token.clone(), response_tx);

    // Covers the window between registration and the `ChunkStream` handoff
    // below: if axum/hyper drops this handler future (HTTP client
    // disconnect) while it's still waiting on the first response frame,
    // nothing else in scope would unregister the transaction or cancel the
    // agent's outbound call (§4.6 step 4, §5 cancellation point (a)).
    let mut pending = PendingGuard::new(state.registry.clone(), cancel_token.clone(), transaction_id.clone());

    let frame = Frame::Tunnel(TunnelControl::OpenHttpTunnelRequest(request));
    let session_id = match state
        .route_table
        .send(&search, Some(&transaction_id), frame, &state.metrics)
        .await
    {
        Ok(sid) => sid,
        Err(Error::NoRoute(name)) => {
            warn!(agent = %name, "no live route for request");
            return (StatusCode::BAD_GATEWAY, "no live agent route").into_response();
        }
        Err(Error::Backpressure(sid)) => {
            warn!(session_id = %sid, "agent send queue full");
            return (StatusCode::BAD_GATEWAY, "agent backpressure").into_response();
        }
        Err(e) => {
            error!(error = %e, "unexpected route table error");
            return (StatusCode::BAD_GATEWAY, "routing error").into_response();
        }
    };

    let mut response_rx = response_rx;
    let first = tokio::select! {
        frame = response_rx.recv() => frame,
        _ = cancel_token.cancelled() => None,
    };

    let header_frame = match first {
        Some(TunnelControl::HttpTunnelResponse(resp)) => resp,
        Some(_other) => {
            error!(transaction_id = %transaction_id, "first response frame was not HttpTunnelResponse");
            return (StatusCode::BAD_GATEWAY, "protocol error").into_response();
        }
        None => {
            return (StatusCode::BAD_GATEWAY, "agent disconnected before responding")
                .into_response();
        }
    };

    // From here on `ChunkStream`'s own `Drop` owns unregistration/cancellation.
    pending.disarm();

    let mut response_headers = HeaderMap::new();
    for header in &header_frame.headers {
        for value in &header.values {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::try_from(header.name.as_str()),
                axum::http::HeaderValue::from_str(value),
            ) {
                response_headers.append(name, value);
            }
        }
    }

    let stream = ChunkStream {
        rx: response_rx,
        cancel: cancel_token,
        registry: state.registry.clone(),
        route_table: state.route_table.clone(),
        search: Search {
            session_id: Some(session_id),
            ..search
        },
        transaction_id,
        done: false,
    };

    let mut response = Response::builder()
        .status(StatusCode::from_u16(header_frame.status).unwrap_or(StatusCode::OK))
        .body(Body::from_stream(stream))
        .expect("status and headers are always valid here");
    *response.headers_mut() = response_headers;
    response
}

/// Unregisters and cancels a transaction on drop unless [`disarm`](Self::disarm)
/// has been called first. Guards the gap before a `ChunkStream` exists to
/// take over that responsibility (§4.6 step 4, §5 cancellation point (a)).
struct PendingGuard {
    registry: SharedRegistry,
    cancel: CancellationToken,
    transaction_id: String,
    armed: bool,
}

impl PendingGuard {
    fn new(registry: SharedRegistry, cancel: CancellationToken, transaction_id: String) -> Self {
        Self {
            registry,
            cancel,
            transaction_id,
            armed: true,
        }
    }

    /// Hands cancellation/unregistration duty to whatever now owns the
    /// transaction's lifetime (a `ChunkStream`), so this guard's `Drop`
    /// becomes a no-op.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.registry.unregister(&self.transaction_id);
        self.cancel.cancel();
    }
}

/// Streams `HttpTunnelChunkedResponse` frames as HTTP body chunks until the
/// terminal empty chunk arrives. If the client drops this stream before
/// that happens (disconnect), `Drop` sends a `CancelRequest` agentward and
/// unregisters the transaction (§4.6 step 6).
struct ChunkStream {
    rx: mpsc::Receiver<TunnelControl>,
    cancel: CancellationToken,
    registry: SharedRegistry,
    route_table: Arc<RouteTable>,
    search: Search,
    transaction_id: String,
    done: bool,
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(TunnelControl::HttpTunnelChunkedResponse(chunk))) => {
                if chunk.is_terminal() {
                    self.done = true;
                    self.registry.unregister(&self.transaction_id);
                    if let Some(session_id) = self.search.session_id.clone() {
                        let route_table = self.route_table.clone();
                        let name = self.search.name.clone();
                        let transaction_id = self.transaction_id.clone();
                        tokio::spawn(async move {
                            route_table
                                .untrack_transaction(&name, &session_id, &transaction_id)
                                .await;
                        });
                    }
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Bytes::from(chunk.body))))
                }
            }
            Poll::Ready(Some(_other)) => {
                warn!(transaction_id = %self.transaction_id, "unexpected control frame mid-response, ending stream");
                self.done = true;
                self.registry.unregister(&self.transaction_id);
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.done = true;
                self.registry.unregister(&self.transaction_id);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.registry.unregister(&self.transaction_id);
        self.cancel.cancel();
        let route_table = self.route_table.clone();
        let search = self.search.clone();
        let id = self.transaction_id.clone();
        tokio::spawn(async move {
            route_table
                .cancel(&search, Frame::Tunnel(TunnelControl::CancelRequest(
                    tunnel_protocol::CancelRequest { id },
                )))
                .await;
        });
    }
}

/// Pulls `(agent, type, name)` either from the `_services` URL prefix or
/// from a verified `x-tunnel-auth` JWT.
fn authenticate(uri: &axum::http::Uri, headers: &HeaderMap, keyset: &KeySet) -> Result<Search, Error> {
    let path = uri.path();
    if let Some(rest) = path.strip_prefix("/_services/") {
        let mut parts = rest.splitn(4, '/');
        let agent = parts.next().filter(|s| !s.is_empty());
        let endpoint_type = parts.next().filter(|s| !s.is_empty());
        let endpoint_name = parts.next().filter(|s| !s.is_empty());
        return match (agent, endpoint_type, endpoint_name) {
            (Some(name), Some(endpoint_type), Some(endpoint_name)) => Ok(Search {
                name: name.to_string(),
                endpoint_type: endpoint_type.to_string(),
                endpoint_name: endpoint_name.to_string(),
                session_id: None,
            }),
            _ => Err(Error::Unauthenticated(
                "_services path must be /_services/{agent}/{type}/{name}/...".into(),
            )),
        };
    }

    let token = headers
        .get("x-tunnel-auth")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthenticated("missing x-tunnel-auth header".into()))?;
    let claims = keyset.verify(token)?;
    Ok(Search {
        name: claims.a,
        endpoint_type: claims.y,
        endpoint_name: claims.n,
        session_id: None,
    })
}

/// Strips the `/_services/{agent}/{type}/{name}` prefix if present, leaving
/// the path the agent's executor should act on; the host is never part of
/// the forwarded URI (§4.6 step 3).
fn strip_prefix_and_host(uri: &axum::http::Uri, search: &Search) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let prefix = format!(
        "/_services/{}/{}/{}",
        search.name, search.endpoint_type, search.endpoint_name
    );
    let stripped = path_and_query.strip_prefix(&prefix).unwrap_or(path_and_query);
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}
