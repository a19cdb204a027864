//! # Configuration
//!
//! Loads the agent's YAML configuration file into [`Config`]. Key naming
//! mirrors the controller's config module (camelCase on the wire).

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// The agent's own mTLS identity, presented to the controller's tunnel
/// listener. Absent only when `insecure` is set, matching the controller's
/// `insecureAgentConnections` escape hatch (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct TlsIdentity {
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    pub root_ca_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EndpointConfig {
    #[serde(rename = "kubernetes")]
    Kubernetes {
        name: String,
        #[serde(default = "default_configured")]
        configured: bool,
        #[serde(default)]
        namespaces: Vec<String>,
        /// Path to a kubeconfig file. Absent means fall back to the
        /// in-pod service-account material (`KUBERNETES_SERVICE_HOST` /
        /// `KUBERNETES_SERVICE_PORT` plus the mounted token and CA).
        #[serde(default)]
        kubeconfig_path: Option<PathBuf>,
        #[serde(default)]
        insecure_skip_verify: bool,
    },
    #[serde(rename = "aws")]
    Aws {
        name: String,
        #[serde(default = "default_configured")]
        configured: bool,
        account_id: Option<String>,
        assume_role: Option<String>,
        #[serde(default)]
        access_key_id: String,
        #[serde(default)]
        secret_access_key: String,
    },
    #[serde(rename = "http")]
    Http {
        name: String,
        #[serde(default = "default_configured")]
        configured: bool,
        base_url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        basic_auth: Option<(String, String)>,
    },
}

impl EndpointConfig {
    pub fn name(&self) -> &str {
        match self {
            EndpointConfig::Kubernetes { name, .. }
            | EndpointConfig::Aws { name, .. }
            | EndpointConfig::Http { name, .. } => name,
        }
    }

    pub fn endpoint_type(&self) -> &'static str {
        match self {
            EndpointConfig::Kubernetes { .. } => "kubernetes",
            EndpointConfig::Aws { .. } => "aws",
            EndpointConfig::Http { .. } => "http",
        }
    }

    pub fn configured(&self) -> bool {
        match self {
            EndpointConfig::Kubernetes { configured, .. }
            | EndpointConfig::Aws { configured, .. }
            | EndpointConfig::Http { configured, .. } => *configured,
        }
    }
}

fn default_configured() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// `wss://host:port` of the controller's tunnel listener.
    pub controller_url: String,
    #[serde(default)]
    pub tls: Option<TlsIdentity>,
    #[serde(default)]
    pub insecure: bool,
    /// Required when `insecure` is set: the controller has no certificate
    /// to derive an agent name from, so it is carried in `Hello.annotations`
    /// under the `agent-name` key instead (§4.2, §9).
    #[serde(default)]
    pub agent_name: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        if !config.insecure && config.tls.is_none() {
            return Err(Error::Config(
                "tls identity is required unless insecure is set".into(),
            ));
        }
        if config.insecure && config.agent_name.is_none() {
            return Err(Error::Config(
                "agentName is required when insecure is set".into(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
controllerUrl: wss://controller.example.com:9001
hostname: agent-0
tls:
  clientCertPath: /etc/agent/client.pem
  clientKeyPath: /etc/agent/client.key
  rootCaPath: /etc/agent/ca.pem
endpoints:
  - type: kubernetes
    name: prod
    kubeconfigPath: /etc/agent/kubeconfig
  - type: aws
    name: billing
    accountId: "123456789012"
    assumeRole: null
    accessKeyId: AKIA...
    secretAccessKey: secret
  - type: http
    name: jenkins
    baseUrl: https://jenkins.internal:8443
    bearerToken: tok
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.endpoints.len(), 3);
        assert_eq!(cfg.endpoints[0].name(), "prod");
        assert_eq!(cfg.endpoints[0].endpoint_type(), "kubernetes");
        assert!(cfg.endpoints[0].configured());
    }

    #[test]
    fn insecure_without_agent_name_fails_to_load() {
        let yaml = r#"
controllerUrl: ws://localhost:9001
hostname: agent-0
insecure: true
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
