//! Tagged-union message frames exchanged on a tunnel stream.
//!
//! `Frame` is the outer union; `TunnelControl` is the inner union carried by
//! `Frame::Tunnel`. Keeping them as two levels mirrors the protocol: `Ping`,
//! `Pong` and `Hello` are session-level concerns, while everything under
//! `TunnelControl` is about one HTTP transaction multiplexed on the session.

use serde::{Deserialize, Serialize};

/// One HTTP header, preserving multi-value semantics (`Set-Cookie`, etc).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub values: Vec<String>,
}

impl HttpHeader {
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }
}

/// A named, typed capability an agent advertises in its `Hello` frame.
///
/// `configured = false` means the agent knows about the endpoint but has no
/// usable credentials for it; the route table must never select such an
/// endpoint for a live request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(rename = "type")]
    pub endpoint_type: String,
    pub configured: bool,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub assume_role: Option<String>,
    #[serde(default)]
    pub annotations: Vec<(String, String)>,
}

/// The agent's opening frame: identity material plus the endpoints it offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub endpoints: Vec<Endpoint>,
    pub version: String,
    pub hostname: String,
    #[serde(default)]
    pub client_cert: Option<Vec<u8>>,
    #[serde(default)]
    pub annotations: Vec<(String, String)>,
}

/// Opens one HTTP transaction on the session. The agent's executor for
/// `type` performs the outbound call and streams the response back under
/// `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHttpTunnelRequest {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub endpoint_type: String,
    pub method: String,
    pub uri: String,
    pub headers: Vec<HttpHeader>,
    #[serde(default)]
    pub body: Vec<u8>,
}

/// Aborts the transaction identified by `id`. Sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub id: String,
}

/// The first response frame for a transaction: status and headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpTunnelResponse {
    pub id: String,
    pub status: u16,
    pub headers: Vec<HttpHeader>,
    pub content_length: Option<u64>,
}

/// A body chunk for a transaction. An empty `body` is the terminal chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpTunnelChunkedResponse {
    pub id: String,
    pub body: Vec<u8>,
}

impl HttpTunnelChunkedResponse {
    pub fn is_terminal(&self) -> bool {
        self.body.is_empty()
    }
}

/// Per-transaction control messages multiplexed on a session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelControl {
    OpenHttpTunnelRequest(OpenHttpTunnelRequest),
    CancelRequest(CancelRequest),
    HttpTunnelResponse(HttpTunnelResponse),
    HttpTunnelChunkedResponse(HttpTunnelChunkedResponse),
}

/// The top-level wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Ping { ts: u64 },
    Pong { ts: u64, echoed_ts: u64 },
    Hello(Hello),
    Tunnel(TunnelControl),
}

impl Frame {
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Frame::Tunnel(TunnelControl::OpenHttpTunnelRequest(r)) => Some(&r.id),
            Frame::Tunnel(TunnelControl::CancelRequest(r)) => Some(&r.id),
            Frame::Tunnel(TunnelControl::HttpTunnelResponse(r)) => Some(&r.id),
            Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(r)) => Some(&r.id),
            Frame::Ping { .. } | Frame::Pong { .. } | Frame::Hello(_) => None,
        }
    }
}
