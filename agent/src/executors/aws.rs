//! # AWS executor
//!
//! Unlike the Kubernetes and HTTP executors, the controller never forwards
//! AWS API calls through the tunnel: this executor signs a pre-computed,
//! STS-style credential payload and returns it as the tunnel response body
//! directly (§4.7).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tunnel_protocol::{HttpHeader, OpenHttpTunnelRequest};

use crate::config::EndpointConfig;
use crate::error::Error;
use crate::executors::{Executor, Responder};

pub struct AwsExecutor {
    account_id: Option<String>,
    assume_role: Option<String>,
    access_key_id: String,
    secret_access_key: String,
}

pub fn build(cfg: &EndpointConfig) -> Result<Arc<dyn Executor>, Error> {
    let EndpointConfig::Aws {
        account_id,
        assume_role,
        access_key_id,
        secret_access_key,
        ..
    } = cfg
    else {
        unreachable!("factory registered only for the aws variant")
    };
    if access_key_id.is_empty() || secret_access_key.is_empty() {
        return Err(Error::Config(
            "aws endpoint is missing accessKeyId or secretAccessKey".into(),
        ));
    }
    Ok(Arc::new(AwsExecutor {
        account_id: account_id.clone(),
        assume_role: assume_role.clone(),
        access_key_id: access_key_id.clone(),
        secret_access_key: secret_access_key.clone(),
    }))
}

#[derive(Serialize)]
struct CredentialPayload<'a> {
    #[serde(rename = "AccessKeyId")]
    access_key_id: &'a str,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: &'a str,
    #[serde(rename = "AccountId")]
    account_id: Option<&'a str>,
    #[serde(rename = "AssumedRole")]
    assumed_role: Option<&'a str>,
}

#[async_trait]
impl Executor for AwsExecutor {
    async fn execute(
        &self,
        _request: OpenHttpTunnelRequest,
        responder: Responder,
        _cancel: CancellationToken,
    ) {
        let payload = CredentialPayload {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            account_id: self.account_id.as_deref(),
            assumed_role: self.assume_role.as_deref(),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(_) => {
                responder.respond_error(502).await;
                return;
            }
        };
        responder
            .respond(
                200,
                vec![HttpHeader::single("content-type", "application/json")],
                Some(body.len() as u64),
            )
            .await;
        responder.send_chunk(body).await;
        responder.finish().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tunnel_protocol::{Frame, TunnelControl};

    fn endpoint(access_key_id: &str, secret_access_key: &str) -> EndpointConfig {
        EndpointConfig::Aws {
            name: "billing".to_string(),
            configured: true,
            account_id: Some("123456789012".to_string()),
            assume_role: None,
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        }
    }

    #[test]
    fn build_rejects_empty_credentials() {
        assert!(build(&endpoint("", "")).is_err());
    }

    #[tokio::test]
    async fn execute_returns_credential_payload_ignoring_the_request() {
        let executor = build(&endpoint("AKIA...", "secret")).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let responder = Responder::new("txn-1".to_string(), tx);
        let request = OpenHttpTunnelRequest {
            id: "txn-1".to_string(),
            name: "billing".to_string(),
            endpoint_type: "aws".to_string(),
            method: "GET".to_string(),
            uri: "/whatever".to_string(),
            headers: vec![],
            body: vec![],
        };

        executor
            .execute(request, responder, CancellationToken::new())
            .await;

        let Frame::Tunnel(TunnelControl::HttpTunnelResponse(resp)) = rx.recv().await.unwrap()
        else {
            panic!("expected HttpTunnelResponse first");
        };
        assert_eq!(resp.status, 200);

        let Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(chunk)) =
            rx.recv().await.unwrap()
        else {
            panic!("expected a chunked response");
        };
        let payload: serde_json::Value = serde_json::from_slice(&chunk.body).unwrap();
        assert_eq!(payload["AccessKeyId"], "AKIA...");
        assert_eq!(payload["AccountId"], "123456789012");

        let Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(terminal)) =
            rx.recv().await.unwrap()
        else {
            panic!("expected terminal chunk");
        };
        assert!(terminal.is_terminal());
    }
}
