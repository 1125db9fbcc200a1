//! Device error types.

use thiserror::Error;

/// Errors from the virtual device layer
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Underlying I/O failure
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device configuration was rejected by the kernel
    #[error("device configuration failed: {0}")]
    Config(String),

    /// The device (or its loopback peer) has been closed
    #[error("device closed")]
    Closed,
}
