//! # Kubernetes executor
//!
//! Holds a dynamically-refreshed [`KubeContext`], snapshot under a read
//! lock on every request so a concurrent refresh cannot tear it, and issues
//! the tunneled HTTP call against the cluster's API server (§4.7).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use reqwest::tls::Certificate as TlsCertificate;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel_protocol::OpenHttpTunnelRequest;

use crate::config::EndpointConfig;
use crate::error::Error;
use crate::executors::{Executor, Responder, CHUNK_SIZE};

/// Base refresh period; actual sleep is this widened by ±10% jitter each
/// cycle to avoid a thundering herd of simultaneous kubeconfig re-reads
/// across many agents started together (§9 open question, resolved).
const REFRESH_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KubeContext {
    pub username: String,
    pub server_url: String,
    pub server_ca: Option<Vec<u8>>,
    pub client_cert: Option<(Vec<u8>, Vec<u8>)>,
    pub token: Option<String>,
    pub insecure: bool,
}

pub struct KubernetesExecutor {
    context: Arc<RwLock<KubeContext>>,
}

pub fn build(cfg: &EndpointConfig) -> Result<Arc<dyn Executor>, Error> {
    let EndpointConfig::Kubernetes {
        kubeconfig_path,
        insecure_skip_verify,
        ..
    } = cfg
    else {
        unreachable!("factory registered only for the kubernetes variant")
    };

    let initial = load_context(kubeconfig_path.as_deref(), *insecure_skip_verify)?;
    if !initial.insecure && initial.server_ca.is_none() {
        return Err(Error::Config(
            "kubernetes context has no CA and insecureSkipVerify is false".into(),
        ));
    }
    let context = Arc::new(RwLock::new(initial));

    let refresh_context = context.clone();
    let refresh_path = kubeconfig_path.clone();
    let insecure = *insecure_skip_verify;
    tokio::spawn(async move {
        refresh_loop(refresh_context, refresh_path, insecure).await;
    });

    Ok(Arc::new(KubernetesExecutor { context }))
}

async fn refresh_loop(context: Arc<RwLock<KubeContext>>, path: Option<PathBuf>, insecure: bool) {
    loop {
        let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
        let delay = REFRESH_INTERVAL.mul_f64(1.0 + jitter);
        time::sleep(delay).await;
        match load_context(path.as_deref(), insecure) {
            Ok(fresh) => {
                let mut guard = context.write().await;
                if *guard != fresh {
                    info!("kubernetes context changed on refresh");
                    *guard = fresh;
                }
            }
            Err(e) => warn!(error = %e, "kubernetes context refresh failed, keeping stale context"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawKubeconfig {
    #[serde(rename = "current-context")]
    current_context: String,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextRef,
}

#[derive(Debug, Deserialize)]
struct ContextRef {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Debug, Deserialize, Default)]
struct User {
    #[serde(default)]
    token: Option<String>,
    #[serde(rename = "client-certificate-data", default)]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data", default)]
    client_key_data: Option<String>,
}

/// Loads cluster connection material from a kubeconfig file, falling back
/// to the in-pod service-account material when no path is configured.
fn load_context(path: Option<&Path>, insecure_override: bool) -> Result<KubeContext, Error> {
    match path {
        Some(path) => load_from_kubeconfig(path, insecure_override),
        None => load_in_pod(insecure_override),
    }
}

fn load_from_kubeconfig(path: &Path, insecure_override: bool) -> Result<KubeContext, Error> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading kubeconfig {}: {e}", path.display())))?;
    let parsed: RawKubeconfig = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("parsing kubeconfig {}: {e}", path.display())))?;

    let ctx = parsed
        .contexts
        .iter()
        .find(|c| c.name == parsed.current_context)
        .ok_or_else(|| Error::Config(format!("context {} not found", parsed.current_context)))?;
    let cluster = parsed
        .clusters
        .iter()
        .find(|c| c.name == ctx.context.cluster)
        .ok_or_else(|| Error::Config(format!("cluster {} not found", ctx.context.cluster)))?;
    let user = parsed
        .users
        .iter()
        .find(|u| u.name == ctx.context.user)
        .ok_or_else(|| Error::Config(format!("user {} not found", ctx.context.user)))?;

    Ok(KubeContext {
        username: user.name.clone(),
        server_url: cluster.cluster.server.clone(),
        server_ca: cluster
            .cluster
            .certificate_authority_data
            .as_deref()
            .map(decode_base64)
            .transpose()?,
        client_cert: match (
            &user.user.client_certificate_data,
            &user.user.client_key_data,
        ) {
            (Some(cert), Some(key)) => Some((decode_base64(cert)?, decode_base64(key)?)),
            _ => None,
        },
        token: user.user.token.clone(),
        insecure: insecure_override || cluster.cluster.insecure_skip_tls_verify,
    })
}

fn load_in_pod(insecure_override: bool) -> Result<KubeContext, Error> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| Error::Config("KUBERNETES_SERVICE_HOST not set".into()))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .map_err(|_| Error::Config("KUBERNETES_SERVICE_PORT not set".into()))?;
    const SA_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
    let token = fs::read_to_string(format!("{SA_DIR}/token"))
        .map_err(|e| Error::Config(format!("reading service account token: {e}")))?;
    let ca = fs::read(format!("{SA_DIR}/ca.crt")).ok();

    Ok(KubeContext {
        username: "in-pod-service-account".to_string(),
        server_url: format!("https://{host}:{port}"),
        server_ca: ca,
        client_cert: None,
        token: Some(token.trim().to_string()),
        insecure: insecure_override,
    })
}

fn decode_base64(s: &str) -> Result<Vec<u8>, Error> {
    BASE64
        .decode(s)
        .map_err(|e| Error::Config(format!("invalid base64 in kubeconfig: {e}")))
}

#[async_trait]
impl Executor for KubernetesExecutor {
    async fn execute(
        &self,
        request: OpenHttpTunnelRequest,
        responder: Responder,
        cancel: CancellationToken,
    ) {
        let context = self.context.read().await.clone();

        let mut builder = reqwest::Client::builder().min_tls_version(reqwest::tls::Version::TLS_1_2);
        if context.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(ca) = &context.server_ca {
            match TlsCertificate::from_pem(ca) {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(e) => {
                    warn!(error = %e, "invalid kubernetes CA certificate");
                    responder.respond_error(502).await;
                    return;
                }
            }
        }
        if let Some((cert_pem, key_pem)) = &context.client_cert {
            let mut pem = cert_pem.clone();
            pem.extend_from_slice(key_pem);
            match reqwest::Identity::from_pem(&pem) {
                Ok(identity) => builder = builder.identity(identity),
                Err(e) => {
                    warn!(error = %e, "invalid kubernetes client certificate");
                    responder.respond_error(502).await;
                    return;
                }
            }
        }

        let client = match builder.build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build kubernetes http client");
                responder.respond_error(502).await;
                return;
            }
        };

        let url = format!("{}{}", context.server_url, request.uri);
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                responder.respond_error(400).await;
                return;
            }
        };
        let mut req = client.request(method, url).body(request.body);
        for header in &request.headers {
            for value in &header.values {
                req = req.header(header.name.clone(), value.clone());
            }
        }
        if let Some(token) = &context.token {
            if !token.is_empty() {
                req = req.bearer_auth(token);
            }
        }

        super::http::run_request(req, responder, cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_current_context_out_of_a_kubeconfig() {
        let yaml = r#"
current-context: prod
clusters:
  - name: prod-cluster
    cluster:
      server: https://10.0.0.1:6443
      certificate-authority-data: aGVsbG8=
contexts:
  - name: prod
    context:
      cluster: prod-cluster
      user: prod-user
users:
  - name: prod-user
    user:
      token: abc123
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        fs::write(&path, yaml).unwrap();

        let ctx = load_from_kubeconfig(&path, false).unwrap();
        assert_eq!(ctx.server_url, "https://10.0.0.1:6443");
        assert_eq!(ctx.token.as_deref(), Some("abc123"));
        assert_eq!(ctx.server_ca, Some(b"hello".to_vec()));
        assert!(!ctx.insecure);
    }

    #[test]
    fn insecure_skip_tls_verify_on_the_cluster_is_honored() {
        let yaml = r#"
current-context: dev
clusters:
  - name: dev-cluster
    cluster:
      server: https://10.0.0.2:6443
      insecure-skip-tls-verify: true
contexts:
  - name: dev
    context:
      cluster: dev-cluster
      user: dev-user
users:
  - name: dev-user
    user: {}
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        fs::write(&path, yaml).unwrap();

        let ctx = load_from_kubeconfig(&path, false).unwrap();
        assert!(ctx.insecure);
        assert!(ctx.server_ca.is_none());
    }

    #[test]
    fn missing_context_is_a_config_error() {
        let yaml = r#"
current-context: missing
clusters: []
contexts: []
users: []
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        fs::write(&path, yaml).unwrap();

        assert!(matches!(
            load_from_kubeconfig(&path, false),
            Err(Error::Config(_))
        ));
    }
}
