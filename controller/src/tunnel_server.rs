//! # Tunnel listener
//!
//! Accepts the raw TCP connections that become agent tunnel streams on
//! `agentAdvertisePort`. This does not go through `axum`: the WebSocket
//! upgrade handshake needs direct access to the terminated TLS session so
//! the peer's client certificate can be pulled out before a single tunnel
//! frame is read (§4.2). `axum` is reserved for the HTTP ingress and
//! health/metrics listeners, which need no such access.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tokio_tungstenite::accept_async;
use tracing::{info, warn};
use tunnel_protocol::CertificateName;

use crate::config::CaConfig;
use crate::error::Error;
use crate::health::Metrics;
use crate::routes::RouteTable;
use crate::session::{self, AgentIdentity};
use crate::transactions::SharedRegistry;

/// Builds the server-side TLS configuration: terminates with the
/// controller's own cert/key, and requires (and verifies) a client
/// certificate rooted at the configured CA.
pub fn build_tls_config(ca: &CaConfig) -> Result<ServerConfig, Error> {
    let certs = load_certs(&ca.server_cert_path)?;
    let key = load_key(&ca.server_key_path)?;

    let mut roots = RootCertStore::empty();
    for root in load_certs(&ca.root_ca_path)? {
        roots
            .add(root)
            .map_err(|e| Error::Tls(format!("invalid root CA cert: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Tls(format!("building client cert verifier: {e}")))?;

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid server cert/key: {e}")))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Runs the accept loop forever. Each accepted connection gets its own
/// spawned task; a single misbehaving agent cannot block others from
/// connecting (§4.8: failures inside a single session never affect others).
pub async fn run(
    addr: SocketAddr,
    tls_config: Option<ServerConfig>,
    insecure: bool,
    route_table: Arc<RouteTable>,
    registry: SharedRegistry,
    metrics: Arc<Metrics>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, insecure, "tunnel listener bound");

    let acceptor = tls_config.map(|cfg| TlsAcceptor::from(Arc::new(cfg)));

    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "tunnel accept error");
                continue;
            }
        };

        let route_table = route_table.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            if let Err(e) =
                accept_one(tcp, peer, acceptor, insecure, route_table, registry, metrics).await
            {
                warn!(%peer, error = %e, "tunnel session ended before handshake");
            }
        });
    }
}

async fn accept_one(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    insecure: bool,
    route_table: Arc<RouteTable>,
    registry: SharedRegistry,
    metrics: Arc<Metrics>,
) -> Result<(), Error> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(tcp)
                .await
                .map_err(|e| Error::Tls(format!("tls accept from {peer}: {e}")))?;
            let agent_name = agent_name_from_peer(&tls)?;
            let ws = accept_async(tls)
                .await
                .map_err(|e| Error::Tls(format!("websocket upgrade from {peer}: {e}")))?;
            info!(%peer, agent = %agent_name, "agent connected over mTLS");
            session::run(
                ws,
                AgentIdentity::FromCertificate(agent_name),
                route_table,
                registry,
                metrics,
            )
            .await;
            Ok(())
        }
        None if insecure => {
            let ws = accept_async(tcp)
                .await
                .map_err(|e| Error::Tls(format!("websocket upgrade from {peer}: {e}")))?;
            warn!(%peer, "agent connected over insecure (no TLS) listener");
            session::run(
                ws,
                AgentIdentity::FromHelloAnnotation,
                route_table,
                registry,
                metrics,
            )
            .await;
            Ok(())
        }
        None => Err(Error::Tls(
            "tunnel listener has no TLS config and insecureAgentConnections is false".into(),
        )),
    }
}

/// Extracts `CertificateName.agent` from the verified leaf certificate's OU
/// field. The TLS handshake already verified the chain against the
/// configured CA; this function only parses content, it does not
/// re-verify (§4.2, §9).
fn agent_name_from_peer(tls: &TlsStream<TcpStream>) -> Result<String, Error> {
    let (_, session) = tls.get_ref();
    let chain = session
        .peer_certificates()
        .ok_or_else(|| Error::Unauthenticated("no peer certificate presented".into()))?;
    let leaf = chain
        .first()
        .ok_or_else(|| Error::Unauthenticated("empty peer certificate chain".into()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| Error::Unauthenticated(format!("malformed leaf certificate: {e}")))?;

    let ou = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| Error::Unauthenticated("certificate has no OU field".into()))?;

    let name = CertificateName::from_ou(ou)
        .map_err(|e| Error::Unauthenticated(format!("bad CertificateName OU: {e}")))?;
    name.require_agent_name()
        .map(str::to_string)
        .map_err(|e| Error::Unauthenticated(e.to_string()))
}
