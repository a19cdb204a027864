//! # Configuration
//!
//! Loads the controller's YAML configuration file into [`Config`]. Matches
//! the key names in the design doc's configuration-file section exactly, so
//! existing config files need no translation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// Paths to the controller's own TLS identity and the CA root used to
/// verify incoming agent certificates.
///
/// The original spec's `caConfig` key is a single path; here it names a
/// small bundle of three PEM paths (root CA, controller server cert, and
/// its private key) since the controller itself needs a cert/key pair to
/// terminate TLS in addition to the CA root it verifies agents against.
#[derive(Debug, Clone, Deserialize)]
pub struct CaConfig {
    pub root_ca_path: PathBuf,
    pub server_cert_path: PathBuf,
    pub server_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAuthConfig {
    pub current_key_name: String,
    pub header_mutation_key_name: String,
    pub secrets_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingService {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub use_http: bool,
    pub service_type: String,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub use_google_api_key: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub incoming_services: Vec<IncomingService>,
    #[serde(default)]
    pub outgoing_services: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub ca_config: CaConfig,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default = "default_agent_advertise_port")]
    pub agent_advertise_port: u16,
    #[serde(default = "default_control_listen_port")]
    pub control_listen_port: u16,
    #[serde(default = "default_service_listen_port")]
    pub service_listen_port: u16,
    #[serde(default = "default_prometheus_listen_port")]
    pub prometheus_listen_port: u16,
    pub agent_hostname: String,
    #[serde(default)]
    pub control_url: Option<String>,
    #[serde(default)]
    pub service_url: Option<String>,
    pub service_auth: ServiceAuthConfig,
    #[serde(default)]
    pub webhook: Vec<String>,
    #[serde(default)]
    pub service_config: ServiceConfig,
    #[serde(default)]
    pub insecure_agent_connections: bool,
}

fn default_agent_advertise_port() -> u16 {
    9001
}
fn default_control_listen_port() -> u16 {
    9002
}
fn default_service_listen_port() -> u16 {
    8080
}
fn default_prometheus_listen_port() -> u16 {
    9102
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
caConfig:
  rootCaPath: /etc/tunnel/ca.pem
  serverCertPath: /etc/tunnel/server.pem
  serverKeyPath: /etc/tunnel/server.key
agentHostname: controller.example.com
serviceAuth:
  currentKeyName: k1
  headerMutationKeyName: hm1
  secretsPath: /etc/tunnel/keys
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.agent_advertise_port, 9001);
        assert_eq!(cfg.prometheus_listen_port, 9102);
        assert!(!cfg.insecure_agent_connections);
    }
}
