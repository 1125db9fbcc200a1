//! Relay error types.

use thiserror::Error;
use veilnet_core::{ConfigError, DirectPathError, IdentityError};

/// Relay server failures; fatal at startup, logged per-connection otherwise
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener socket failure
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),

    /// TLS material failure
    #[error(transparent)]
    Tls(#[from] DirectPathError),

    /// Identity store failure
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}
