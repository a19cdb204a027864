//! # Generic HTTP executor
//!
//! Same request/response pattern as the Kubernetes executor but against a
//! static base URL with static credentials (basic or bearer auth) rather
//! than a dynamically-refreshed cluster context (§4.7).

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tunnel_protocol::{HttpHeader, OpenHttpTunnelRequest};

use crate::config::EndpointConfig;
use crate::error::Error;
use crate::executors::{Executor, Responder, CHUNK_SIZE};

pub struct HttpExecutor {
    base_url: String,
    bearer_token: Option<String>,
    basic_auth: Option<(String, String)>,
    client: reqwest::Client,
}

pub fn build(cfg: &EndpointConfig) -> Result<Arc<dyn Executor>, Error> {
    let EndpointConfig::Http {
        base_url,
        bearer_token,
        basic_auth,
        ..
    } = cfg
    else {
        unreachable!("factory registered only for the http variant")
    };

    let client = reqwest::Client::builder()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .build()
        .map_err(|e| Error::Config(format!("building http client: {e}")))?;

    Ok(Arc::new(HttpExecutor {
        base_url: base_url.clone(),
        bearer_token: bearer_token.clone(),
        basic_auth: basic_auth.clone(),
        client,
    }))
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(
        &self,
        request: OpenHttpTunnelRequest,
        responder: Responder,
        cancel: CancellationToken,
    ) {
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                responder.respond_error(400).await;
                return;
            }
        };
        let url = format!("{}{}", self.base_url, request.uri);
        let mut req = self.client.request(method, url).body(request.body);
        for header in &request.headers {
            for value in &header.values {
                req = req.header(header.name.clone(), value.clone());
            }
        }
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        } else if let Some((user, pass)) = &self.basic_auth {
            req = req.basic_auth(user, Some(pass));
        }

        run_request(req, responder, cancel).await;
    }
}

/// Sends one buffered request, writes the header frame, then streams the
/// response body in `CHUNK_SIZE` chunks, terminating with an empty chunk.
/// Shared by the HTTP and Kubernetes executors, which differ only in how
/// the `reqwest::RequestBuilder` was constructed (§4.7: "same pattern").
pub async fn run_request(
    req: reqwest::RequestBuilder,
    responder: Responder,
    cancel: CancellationToken,
) {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = req.send() => result,
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "outbound request failed");
            responder.respond_error(502).await;
            return;
        }
    };

    let status = response.status().as_u16();
    let content_length = response.content_length();
    let headers = response
        .headers()
        .keys()
        .map(|name| HttpHeader {
            name: name.as_str().to_string(),
            values: response
                .headers()
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
                .collect(),
        })
        .collect();
    responder.respond(status, headers, content_length).await;

    let mut stream = response.bytes_stream();
    let mut buf = Vec::with_capacity(CHUNK_SIZE);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                buf.extend_from_slice(&bytes);
                while buf.len() >= CHUNK_SIZE {
                    let rest = buf.split_off(CHUNK_SIZE);
                    responder.send_chunk(std::mem::replace(&mut buf, rest)).await;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "error reading response body");
                break;
            }
            None => break,
        }
    }
    if !buf.is_empty() {
        responder.send_chunk(buf).await;
    }
    responder.finish().await;
}
