//! # Tunnel wire protocol
//!
//! Defines the tagged-union frames exchanged between the controller and an
//! agent over one full-duplex stream per agent session, and the codec that
//! turns them into bytes. This crate has no opinion about transport: the
//! controller and the agent each carry one of these frames per WebSocket
//! binary message, but nothing here depends on WebSocket specifically.
//!
//! ## Modules
//!
//! - [`frame`]  — the `Frame` / `TunnelControl` tagged unions and their payloads
//! - [`codec`]  — encode/decode between `Frame` and bytes, forward-compatible
//!   with frame tags this crate doesn't know about
//! - [`identity`] — `CertificateName`, decoded from a peer certificate's OU field

pub mod codec;
pub mod frame;
pub mod identity;

pub use codec::{decode, encode, CodecError};
pub use frame::{
    Endpoint, Hello, HttpHeader, HttpTunnelChunkedResponse, HttpTunnelResponse,
    OpenHttpTunnelRequest, CancelRequest, Frame, TunnelControl,
};
pub use identity::{CertificateName, Purpose};
