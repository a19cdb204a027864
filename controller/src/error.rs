//! Crate-level error type for the controller.
//!
//! Fallible internal operations return `Result<T, Error>` and propagate with
//! `?`; `main` wraps the top-level bootstrap in `anyhow::Result` for
//! operator-facing context, per the taxonomy in the design doc's error
//! handling section.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("no live route for {0}")]
    NoRoute(String),

    #[error("route send backpressure: queue for session {0} is full")]
    Backpressure(String),

    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    #[error(transparent)]
    Codec(#[from] tunnel_protocol::CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
