//! Codec error types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Header byte 0 is not the supported protocol version
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Declared total size exceeds the 65 535-byte ceiling
    #[error("message size {0} exceeds maximum")]
    OversizeMessage(usize),

    /// The buffer ended before the declared payload was complete
    #[error("truncated payload")]
    TruncatedPayload,

    /// Message type code outside the defined and reserved-ignorable ranges
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// A length-prefixed field declared more bytes than the payload holds
    #[error("invalid field length {0}")]
    InvalidFieldLength(usize),
}
