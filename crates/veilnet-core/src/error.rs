//! Core error types.

use thiserror::Error;
use veilnet_crypto::CryptoError;
use veilnet_proto::CodecError;

/// Handshake failures (initial exchange, pair establishment, re-handshake)
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// PQ or classical signature verification failed, or proof mismatch
    #[error("invalid signature")]
    InvalidSignature,

    /// The advertised endpoint id does not hash from the presented key
    #[error("endpoint id does not match presented public key")]
    IdentityMismatch,

    /// Timestamp skew beyond the 30 s window
    #[error("timestamp outside replay window")]
    ReplayAttack,

    /// The exchange did not complete within its deadline
    #[error("handshake timed out")]
    Timeout,

    /// Session id in a message does not match the current session
    #[error("session id mismatch")]
    SessionMismatch,

    /// A message arrived out of protocol order
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// The peer reported an error
    #[error("peer error {code:#06x}: {message}")]
    PeerError {
        /// Protocol error code
        code: u16,
        /// Free-form text from the peer
        message: String,
    },

    /// Underlying primitive failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Wire decoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Frame pipeline failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Frame shorter than the 14-byte Ethernet header
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Frame longer than MTU + 14
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Counter already seen or beyond the replay window
    #[error("replayed or stale frame counter {0}")]
    Replay(u64),

    /// AEAD tag mismatch; frame dropped, session continues
    #[error("frame decryption failed")]
    Decrypt,

    /// TX counter reached the rotation ceiling; rekey before sending
    #[error("frame counter exhausted, key rotation required")]
    CounterExhausted,

    /// Pair keys have not been established yet
    #[error("pipeline keys not ready")]
    NotReady,
}

/// Transport session failures
#[derive(Debug, Error)]
pub enum SessionError {
    /// WebSocket transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Bounded writer queue was full; the message was dropped
    #[error("writer queue full")]
    QueueFull,

    /// The session is closing or closed
    #[error("session closed")]
    Closed,

    /// No inbound traffic for three heartbeat intervals
    #[error("session idle timeout")]
    IdleTimeout,
}

/// Direct-path failures, surfaced to the manager which falls back to relay
#[derive(Debug, Error)]
pub enum DirectPathError {
    /// Listener socket failure
    #[error("direct listener error: {0}")]
    Listener(String),

    /// Outbound dial failure
    #[error("direct dial failed: {0}")]
    Dial(String),

    /// TLS setup or handshake failure
    #[error("direct TLS error: {0}")]
    Tls(String),

    /// Peer certificate did not match the pinned fingerprint
    #[error("peer certificate does not match pinned fingerprint")]
    PinMismatch,

    /// Certificate signature by the peer's long-term key did not verify
    #[error("peer certificate signature invalid")]
    CertSignature,

    /// Key confirmation failed or timed out
    #[error("re-handshake failed: {0}")]
    Rehandshake(#[from] HandshakeError),

    /// The attempt exceeded its deadline
    #[error("direct path attempt timed out")]
    Timeout,

    /// Shutdown was requested while the attempt was in flight
    #[error("direct path attempt aborted")]
    Aborted,
}

/// Identity store failures; fatal at startup
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Filesystem failure
    #[error("identity I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key material is corrupt or has the wrong size; the process must
    /// refuse to start rather than silently generate a new identity
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Key generation failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Configuration validation failures; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Top-level endpoint failures
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Relay connection or reconnect budget exhausted
    #[error("relay connection failed: {0}")]
    RelayConnect(String),

    /// Handshake with the relay or peer failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Session-level failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Direct-path failure that could not be recovered by fallback
    #[error(transparent)]
    DirectPath(#[from] DirectPathError),

    /// Virtual device failure
    #[error("device error: {0}")]
    Device(#[from] veilnet_device::DeviceError),

    /// Identity store failure
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}
