//! # Agent session state machine
//!
//! One accepted tunnel stream runs through `Handshake → Open → Draining →
//! Closed`. `Open` spawns a reader task (decodes frames, dispatches them)
//! and relies on the caller to drive the writer loop (draining the route's
//! send channel and emitting periodic pings) — see [`run`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use tunnel_protocol::{codec, Frame, Hello, TunnelControl};

use crate::health::Metrics;
use crate::routes::{Route, RouteTable};
use crate::transactions::SharedRegistry;

/// Default keepalive ping interval (§4.4, §5).
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Liveness timeout: no frame heard within this long forces `Draining`.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);
/// Deadline for receiving `Hello` after accept.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no Hello received within the handshake deadline")]
    HandshakeTimeout,
    #[error("stream closed before Hello")]
    StreamClosedDuringHandshake,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// How the session's agent name was established before the first frame
/// arrived, or how it should be recovered from `Hello` once it does.
pub enum AgentIdentity {
    /// Derived from the peer's verified TLS certificate (§4.2). Used as-is.
    FromCertificate(String),
    /// No certificate was presented (`--insecureAgentConnections`). The name
    /// is read from the `agent-name` key in `Hello.annotations` instead.
    FromHelloAnnotation,
}

/// Runs one agent session end to end: waits for `Hello`, registers a route,
/// then drives reader and writer loops until the stream closes, at which
/// point the route is removed and its outstanding transactions cancelled.
pub async fn run<S>(
    mut ws: WebSocketStream<S>,
    identity: AgentIdentity,
    route_table: Arc<RouteTable>,
    registry: SharedRegistry,
    metrics: Arc<Metrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hello = match time::timeout(HANDSHAKE_DEADLINE, recv_hello(&mut ws)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            warn!(error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            warn!("handshake deadline exceeded, no Hello received");
            return;
        }
    };

    let agent_name = match identity {
        AgentIdentity::FromCertificate(name) => name,
        AgentIdentity::FromHelloAnnotation => {
            match hello
                .annotations
                .iter()
                .find(|(k, _)| k == "agent-name")
                .map(|(_, v)| v.clone())
            {
                Some(name) => name,
                None => {
                    warn!("insecure session sent no agent-name annotation, rejecting");
                    return;
                }
            }
        }
    };

    let (send_tx, mut send_rx) = mpsc::channel::<Frame>(256);
    let route = Arc::new(Route::new(
        agent_name.clone(),
        hello.endpoints,
        hello.version,
        hello.hostname,
        send_tx,
    ));
    route_table.add(route.clone()).await;
    info!(agent = %agent_name, session_id = %route.session_id, "session open");

    let (mut ws_sink, mut ws_stream) = ws.split();
    let mut last_heard = Instant::now();
    let mut ping_interval = time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            biased;

            // Writer half: drain the route's outbound queue.
            outgoing = send_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if let Err(e) = send_frame(&mut ws_sink, &frame).await {
                            warn!(agent = %agent_name, error = %e, "write error, draining session");
                            break;
                        }
                    }
                    None => break, // sender dropped: route was removed elsewhere
                }
            }

            // Keepalive ping on a fixed cadence.
            _ = ping_interval.tick() => {
                let ping = Frame::Ping { ts: now_ts() };
                if let Err(e) = send_frame(&mut ws_sink, &ping).await {
                    warn!(agent = %agent_name, error = %e, "ping write failed");
                    break;
                }
            }

            // Reader half: decode and dispatch one inbound frame.
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        last_heard = Instant::now();
                        route.statistics.frames_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        metrics.frames_received.inc();
                        match codec::decode(&bytes) {
                            Ok(Some(frame)) => {
                                if let Some(reply) = dispatch(&agent_name, &route, &registry, frame).await {
                                    if send_frame(&mut ws_sink, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => { /* unknown tag already logged by the codec */ }
                            Err(e) => {
                                error!(agent = %agent_name, error = %e, "frame decode error, closing session");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(agent = %agent_name, "stream closed by peer");
                        break;
                    }
                    Some(Ok(_)) => { /* ignore text/ping/pong websocket control frames */ }
                    Some(Err(e)) => {
                        warn!(agent = %agent_name, error = %e, "websocket read error");
                        break;
                    }
                }
            }

            // Liveness: no frame heard within 3x the ping interval.
            _ = time::sleep_until(last_heard + LIVENESS_TIMEOUT) => {
                warn!(agent = %agent_name, session_id = %route.session_id, "ping timeout, draining session");
                break;
            }
        }
    }

    route_table
        .remove(&agent_name, &route.session_id, &registry)
        .await;
    info!(agent = %agent_name, session_id = %route.session_id, "session closed");
}

async fn recv_hello<S>(ws: &mut WebSocketStream<S>) -> Result<Hello, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(bytes))) => match codec::decode(&bytes) {
                Ok(Some(Frame::Hello(hello))) => return Ok(hello),
                Ok(Some(_other)) => {
                    debug!("ignoring non-Hello frame before handshake completes");
                    continue;
                }
                Ok(None) => continue,
                Err(e) => return Err(SessionError::WebSocket(e.into())),
            },
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SessionError::WebSocket(e)),
            None => return Err(SessionError::StreamClosedDuringHandshake),
        }
    }
}

async fn send_frame<Sink>(
    sink: &mut Sink,
    frame: &Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    Sink: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let bytes = match codec::encode(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to encode frame");
            return Ok(());
        }
    };
    sink.send(Message::Binary(bytes)).await
}

/// Handles one decoded frame from the agent. Returns an immediate reply
/// frame when one is warranted (a `Pong` for an agent-sent `Ping`).
async fn dispatch(
    agent_name: &str,
    route: &Route,
    registry: &SharedRegistry,
    frame: Frame,
) -> Option<Frame> {
    match frame {
        Frame::Ping { ts } => Some(Frame::Pong {
            ts: now_ts(),
            echoed_ts: ts,
        }),
        Frame::Pong { .. } => None,
        Frame::Hello(_) => {
            warn!(agent = agent_name, "unexpected Hello after handshake, ignoring");
            None
        }
        Frame::Tunnel(TunnelControl::HttpTunnelResponse(resp)) => {
            registry
                .dispatch_response(&resp.id, TunnelControl::HttpTunnelResponse(resp))
                .await;
            None
        }
        Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(chunk)) => {
            registry
                .dispatch_response(&chunk.id, TunnelControl::HttpTunnelChunkedResponse(chunk))
                .await;
            None
        }
        Frame::Tunnel(TunnelControl::CancelRequest(cancel)) => {
            registry.cancel(&cancel.id);
            None
        }
        Frame::Tunnel(TunnelControl::OpenHttpTunnelRequest(_)) => {
            warn!(
                agent = agent_name,
                session_id = %route.session_id,
                "agent sent OpenHttpTunnelRequest on the controller side, ignoring"
            );
            None
        }
    }
}
