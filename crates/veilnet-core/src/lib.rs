//! # VEILNET Core
//!
//! The encrypted tunnel with resilient transport: hybrid post-quantum
//! handshake, frame pipeline with replay protection, transport sessions over
//! WebSocket/TLS, and the direct-path manager that migrates traffic from the
//! rendezvous relay to a peer-to-peer connection and back.
//!
//! Layering (leaves first):
//!
//! - [`identity`] — long-term signing keys and the derived endpoint id
//! - [`handshake`] — sans-IO HELLO/CHALLENGE/RESPONSE/ESTABLISHED state machines
//! - [`pair`] — end-to-end pair key establishment through the relay
//! - [`replay`] / [`pipeline`] — frame encryption, counters, replay window
//! - [`session`] — reader/writer/heartbeat tasks over one byte stream
//! - [`cert`] / [`tls`] — ephemeral direct-path certificates and pinned TLS
//! - [`direct`] — listener, dialer, re-handshake, zero-loss migration
//! - [`endpoint`] — owns the device, the sessions, and the egress switch
//! - [`config`] — the typed configuration contract

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cert;
pub mod config;
pub mod direct;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod pair;
pub mod pipeline;
pub mod replay;
pub mod session;
pub mod time;
pub mod tls;
pub mod wsio;

pub use error::{
    ConfigError, DirectPathError, EndpointError, HandshakeError, IdentityError, PipelineError,
    SessionError,
};
pub use identity::Identity;

/// A 32-byte endpoint identifier (client or relay), derived by hashing the
/// long-term ML-DSA-87 public key
pub type EndpointId = [u8; 32];

/// A 16-byte session identifier minted by the handshake responder
pub type SessionId = [u8; 16];
