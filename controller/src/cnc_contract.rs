//! # CNC REST surface — wire contract only
//!
//! The command-and-control service that mints agent/control certificates
//! and renders Kubernetes manifests lives outside this binary (§1 Out of
//! scope). These types model its request/response JSON shapes only, so the
//! controller can be tested against the contract without reimplementing a
//! certificate authority. No handler in this crate serves these routes;
//! they document what the external CNC is expected to speak.

use serde::{Deserialize, Serialize};

use crate::routes::RouteStatisticsSnapshot;

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateKubectlComponentsRequest {
    pub agent_name: String,
    pub cluster_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateAgentManifestComponentsRequest {
    pub agent_name: String,
    pub namespace: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateServiceCredentialsRequest {
    pub agent_name: String,
    pub endpoint_name: String,
    pub endpoint_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateControlCredentialsRequest {
    pub requester: String,
}

/// Shared success shape for all four `generate*` endpoints: base64-encoded
/// PEM material from the CA.
#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub certificate_pem_base64: String,
    pub private_key_pem_base64: String,
    #[serde(default)]
    pub extra_files: Vec<NamedFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedFile {
    pub name: String,
    pub content_base64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub routes: std::collections::HashMap<String, Vec<RouteStatisticsSnapshot>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CncError {
    pub error: CncErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CncErrorBody {
    pub message: String,
}
