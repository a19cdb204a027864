//! # Controller connection loop
//!
//! Connects outbound to the controller's tunnel listener, sends `Hello`,
//! and runs the session until the stream drops, then reconnects after a
//! delay. Structured the same way as the controller's per-session loop
//! (one `tokio::select!` over writer, ping timer, and reader) so the two
//! sides of the protocol read as mirror images of each other.

use std::fs::File;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{error, info, warn};
use tunnel_protocol::{codec, Endpoint, Frame, Hello, TunnelControl};

/// Either a plain TCP stream (insecure mode) or a terminated TLS session.
/// Rolled by hand rather than pulled from `tokio-tungstenite`'s own
/// TLS-connector plumbing, matching the controller's tunnel listener which
/// also drives `rustls` directly instead of through a higher-level wrapper.
enum AgentStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for AgentStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AgentStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AgentStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AgentStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AgentStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AgentStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

use crate::config::{Config, EndpointConfig, TlsIdentity};
use crate::error::Error;
use crate::executors::ExecutorRegistry;

/// Same cadence as the controller side (§4.4, §5).
const PING_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);
/// Delay before reconnecting after any disconnect, mirroring the reference
/// client's fixed back-off.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Runs the agent's connection loop forever: connect, handshake, serve
/// requests until disconnected, wait, repeat.
pub async fn run(config: Arc<Config>, registry: Arc<ExecutorRegistry>) {
    loop {
        match connect_once(&config).await {
            Ok(ws) => {
                info!(url = %config.controller_url, "connected to controller");
                serve(ws, &config, &registry).await;
                warn!("disconnected from controller");
            }
            Err(e) => {
                error!(error = %e, "connection attempt failed");
            }
        }
        time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_once(config: &Config) -> Result<WebSocketStream<AgentStream>, Error> {
    let uri: tokio_tungstenite::tungstenite::http::Uri = config
        .controller_url
        .parse()
        .map_err(|e| Error::Config(format!("invalid controllerUrl: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| Error::Config("controllerUrl has no host".into()))?
        .to_string();
    let port = uri
        .port_u16()
        .unwrap_or(if config.tls.is_some() { 9001 } else { 80 });

    let tcp = TcpStream::connect((host.as_str(), port)).await?;

    let stream = match &config.tls {
        Some(identity) => {
            let connector = TlsConnector::from(Arc::new(build_client_config(identity)?));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| Error::Tls(format!("invalid DNS name {host}")))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::Tls(format!("tls connect to {host}:{port}: {e}")))?;
            AgentStream::Tls(tls)
        }
        None => {
            warn!("connecting without TLS (insecure mode)");
            AgentStream::Plain(tcp)
        }
    };

    let (ws, _response) = client_async(&config.controller_url, stream)
        .await
        .map_err(|e| Error::Tls(format!("websocket handshake: {e}")))?;
    Ok(ws)
}

fn build_client_config(identity: &TlsIdentity) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for root in load_certs(&identity.root_ca_path)? {
        roots
            .add(root)
            .map_err(|e| Error::Tls(format!("invalid root CA cert: {e}")))?;
    }
    let certs = load_certs(&identity.client_cert_path)?;
    let key = load_key(&identity.client_key_path)?;

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid client cert/key: {e}")))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", path.display())))
}

fn load_key(path: &std::path::Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

fn endpoints_from_config(endpoints: &[EndpointConfig]) -> Vec<Endpoint> {
    endpoints
        .iter()
        .map(|e| Endpoint {
            name: e.name().to_string(),
            endpoint_type: e.endpoint_type().to_string(),
            configured: e.configured(),
            namespaces: match e {
                EndpointConfig::Kubernetes { namespaces, .. } => namespaces.clone(),
                _ => vec![],
            },
            account_id: match e {
                EndpointConfig::Aws { account_id, .. } => account_id.clone(),
                _ => None,
            },
            assume_role: match e {
                EndpointConfig::Aws { assume_role, .. } => assume_role.clone(),
                _ => None,
            },
            annotations: vec![],
        })
        .collect()
}

/// Drives one connected session: sends `Hello`, then a single
/// `tokio::select!` loop over the writer half (outbound frames from
/// executors, keepalive pings) and the reader half (dispatch inbound
/// requests to executors, handle cancellation and pong bookkeeping).
async fn serve(ws: WebSocketStream<AgentStream>, config: &Config, registry: &Arc<ExecutorRegistry>) {
    let (mut sink, mut stream) = ws.split();

    let hello = Frame::Hello(Hello {
        endpoints: endpoints_from_config(&config.endpoints),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: config.hostname.clone(),
        client_cert: None,
        annotations: config
            .agent_name
            .iter()
            .map(|n| ("agent-name".to_string(), n.clone()))
            .collect(),
    });
    if let Err(e) = send_frame(&mut sink, &hello).await {
        error!(error = %e, "failed to send Hello");
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);
    let mut ping_interval = time::interval(PING_INTERVAL);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            biased;

            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                let ping = Frame::Ping { ts: now_ts() };
                if send_frame(&mut sink, &ping).await.is_err() {
                    break;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        last_heard = Instant::now();
                        match codec::decode(&bytes) {
                            Ok(Some(frame)) => {
                                if let Some(reply) = dispatch(frame, registry, &outbound_tx).await {
                                    if send_frame(&mut sink, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => { /* unknown tag already logged by the codec */ }
                            Err(e) => {
                                error!(error = %e, "frame decode error, closing session");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("stream closed by controller");
                        break;
                    }
                    Some(Ok(_)) => { /* ignore text/ping/pong websocket control frames */ }
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }

            _ = time::sleep_until(last_heard + LIVENESS_TIMEOUT) => {
                warn!("ping timeout, reconnecting");
                break;
            }
        }
    }

    registry.cancel_all();
}

/// Handles one decoded frame from the controller. `OpenHttpTunnelRequest`
/// spawns an executor task that streams its own response frames back via
/// `outbound_tx`; this function never blocks on that work.
async fn dispatch(
    frame: Frame,
    registry: &Arc<ExecutorRegistry>,
    outbound_tx: &mpsc::Sender<Frame>,
) -> Option<Frame> {
    match frame {
        Frame::Ping { ts } => Some(Frame::Pong {
            ts: now_ts(),
            echoed_ts: ts,
        }),
        Frame::Pong { .. } => None,
        Frame::Hello(_) => {
            warn!("unexpected Hello mid-session, ignoring");
            None
        }
        Frame::Tunnel(TunnelControl::OpenHttpTunnelRequest(request)) => {
            registry.spawn(request, outbound_tx.clone());
            None
        }
        Frame::Tunnel(TunnelControl::CancelRequest(cancel)) => {
            registry.cancel(&cancel.id);
            None
        }
        Frame::Tunnel(TunnelControl::HttpTunnelResponse(_))
        | Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(_)) => {
            warn!("controller sent a response frame on the agent side, ignoring");
            None
        }
    }
}

async fn send_frame(
    sink: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let bytes = match codec::encode(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to encode frame");
            return Ok(());
        }
    };
    sink.send(Message::Binary(bytes)).await
}
