//! Crate-level error type for the agent.
//!
//! Mirrors `tunnel_controller::Error`'s shape: fallible internal operations
//! return `Result<T, Error>` and propagate with `?`; `main` wraps bootstrap
//! in `anyhow::Result` for operator-facing context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("no executor registered for endpoint type {0:?}")]
    UnknownEndpointType(String),

    #[error(transparent)]
    Codec(#[from] tunnel_protocol::CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
