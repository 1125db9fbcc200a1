//! # VEILNET Relay
//!
//! The rendezvous server. Terminates TLS-carrying WebSocket connections at
//! `/ws`, runs the hybrid handshake with each client independently, pairs
//! the two clients of a session, publishes each one's address and
//! direct-path certificate to the other, and forwards their end-to-end
//! encrypted frames opaquely. The relay never holds frame keys and never
//! decrypts a DATA_FRAME.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod rate;
pub mod registry;
pub mod server;

pub use config::RelayServerConfig;
pub use error::RelayError;
pub use server::RelayServer;
