//! Encode/decode between [`Frame`] and bytes.
//!
//! Each on-wire message is a small envelope — a tag plus an opaque payload —
//! rather than a bare `bincode`-derived enum. `bincode` encodes Rust enums by
//! variant index, so a future tag this binary doesn't know about would be
//! undecodable garbage with no way to skip past it. The envelope fixes that:
//! the tag and payload length are always decodable, so an unrecognized tag
//! can be logged and dropped instead of failing the whole session, the same
//! way a protobuf reader ignores unknown field numbers.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::frame::{
    CancelRequest, Frame, Hello, HttpTunnelChunkedResponse, HttpTunnelResponse,
    OpenHttpTunnelRequest, TunnelControl,
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode frame envelope: {0}")]
    Envelope(#[source] bincode::Error),
    #[error("failed to decode payload for tag {tag}: {source}")]
    Payload {
        tag: u16,
        #[source]
        source: bincode::Error,
    },
}

#[derive(Serialize, serde::Deserialize)]
struct Envelope {
    tag: u16,
    payload: Vec<u8>,
}

const TAG_PING: u16 = 1;
const TAG_PONG: u16 = 2;
const TAG_HELLO: u16 = 3;
const TAG_OPEN_HTTP_TUNNEL_REQUEST: u16 = 10;
const TAG_CANCEL_REQUEST: u16 = 11;
const TAG_HTTP_TUNNEL_RESPONSE: u16 = 12;
const TAG_HTTP_TUNNEL_CHUNKED_RESPONSE: u16 = 13;

#[derive(Serialize, serde::Deserialize)]
struct PingBody {
    ts: u64,
}

#[derive(Serialize, serde::Deserialize)]
struct PongBody {
    ts: u64,
    echoed_ts: u64,
}

/// Encode one [`Frame`] into bytes suitable for a single transport message
/// (one WebSocket binary frame carries exactly one encoded [`Frame`]).
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let (tag, payload) = match frame {
        Frame::Ping { ts } => (TAG_PING, to_bytes(&PingBody { ts: *ts })?),
        Frame::Pong { ts, echoed_ts } => (
            TAG_PONG,
            to_bytes(&PongBody {
                ts: *ts,
                echoed_ts: *echoed_ts,
            })?,
        ),
        Frame::Hello(hello) => (TAG_HELLO, to_bytes(hello)?),
        Frame::Tunnel(TunnelControl::OpenHttpTunnelRequest(r)) => {
            (TAG_OPEN_HTTP_TUNNEL_REQUEST, to_bytes(r)?)
        }
        Frame::Tunnel(TunnelControl::CancelRequest(r)) => (TAG_CANCEL_REQUEST, to_bytes(r)?),
        Frame::Tunnel(TunnelControl::HttpTunnelResponse(r)) => {
            (TAG_HTTP_TUNNEL_RESPONSE, to_bytes(r)?)
        }
        Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(r)) => {
            (TAG_HTTP_TUNNEL_CHUNKED_RESPONSE, to_bytes(r)?)
        }
    };
    to_bytes(&Envelope { tag, payload }).map_err(CodecError::Encode)
}

/// Decode one transport message into a [`Frame`].
///
/// Returns `Ok(None)` when the tag is not recognized by this build — the
/// caller should log and move on rather than treat it as a protocol error,
/// per the codec's forward-compatibility requirement.
pub fn decode(bytes: &[u8]) -> Result<Option<Frame>, CodecError> {
    let envelope: Envelope = bincode::deserialize(bytes).map_err(CodecError::Envelope)?;
    let frame = match envelope.tag {
        TAG_PING => Frame::Ping {
            ts: from_bytes::<PingBody>(envelope.tag, &envelope.payload)?.ts,
        },
        TAG_PONG => {
            let body = from_bytes::<PongBody>(envelope.tag, &envelope.payload)?;
            Frame::Pong {
                ts: body.ts,
                echoed_ts: body.echoed_ts,
            }
        }
        TAG_HELLO => Frame::Hello(from_bytes::<Hello>(envelope.tag, &envelope.payload)?),
        TAG_OPEN_HTTP_TUNNEL_REQUEST => Frame::Tunnel(TunnelControl::OpenHttpTunnelRequest(
            from_bytes::<OpenHttpTunnelRequest>(envelope.tag, &envelope.payload)?,
        )),
        TAG_CANCEL_REQUEST => Frame::Tunnel(TunnelControl::CancelRequest(from_bytes::<
            CancelRequest,
        >(
            envelope.tag, &envelope.payload
        )?)),
        TAG_HTTP_TUNNEL_RESPONSE => Frame::Tunnel(TunnelControl::HttpTunnelResponse(
            from_bytes::<HttpTunnelResponse>(envelope.tag, &envelope.payload)?,
        )),
        TAG_HTTP_TUNNEL_CHUNKED_RESPONSE => Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(
            from_bytes::<HttpTunnelChunkedResponse>(envelope.tag, &envelope.payload)?,
        )),
        unknown => {
            tracing::warn!(tag = unknown, "dropping frame with unrecognized tag");
            return Ok(None);
        }
    };
    Ok(Some(frame))
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(CodecError::Encode)
}

fn from_bytes<T: DeserializeOwned>(tag: u16, bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|source| CodecError::Payload { tag, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Endpoint, HttpHeader};

    fn sample_hello() -> Frame {
        Frame::Hello(Hello {
            endpoints: vec![Endpoint {
                name: "prod".into(),
                endpoint_type: "kubernetes".into(),
                configured: true,
                namespaces: vec!["default".into()],
                account_id: None,
                assume_role: None,
                annotations: vec![],
            }],
            version: "1.2.3".into(),
            hostname: "agent-0".into(),
            client_cert: None,
            annotations: vec![],
        })
    }

    #[test]
    fn round_trips_every_variant() {
        let frames = vec![
            Frame::Ping { ts: 42 },
            Frame::Pong {
                ts: 42,
                echoed_ts: 41,
            },
            sample_hello(),
            Frame::Tunnel(TunnelControl::OpenHttpTunnelRequest(OpenHttpTunnelRequest {
                id: "t-1".into(),
                name: "prod".into(),
                endpoint_type: "kubernetes".into(),
                method: "GET".into(),
                uri: "/v1/pods".into(),
                headers: vec![HttpHeader::single("accept", "application/json")],
                body: vec![],
            })),
            Frame::Tunnel(TunnelControl::CancelRequest(CancelRequest { id: "t-1".into() })),
            Frame::Tunnel(TunnelControl::HttpTunnelResponse(HttpTunnelResponse {
                id: "t-1".into(),
                status: 200,
                headers: vec![],
                content_length: Some(2),
            })),
            Frame::Tunnel(TunnelControl::HttpTunnelChunkedResponse(
                HttpTunnelChunkedResponse {
                    id: "t-1".into(),
                    body: b"{}".to_vec(),
                },
            )),
        ];

        for frame in frames {
            let bytes = encode(&frame).expect("encode");
            let decoded = decode(&bytes).expect("decode").expect("known tag");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn unrecognized_tag_is_dropped_not_errored() {
        let bytes = to_bytes(&Envelope {
            tag: 9999,
            payload: vec![],
        })
        .unwrap();
        assert_eq!(decode(&bytes).expect("no decode error"), None);
    }

    #[test]
    fn empty_body_chunk_is_terminal() {
        let chunk = HttpTunnelChunkedResponse {
            id: "t-1".into(),
            body: vec![],
        };
        assert!(chunk.is_terminal());
    }
}
