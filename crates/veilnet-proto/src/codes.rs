//! Protocol error codes, close reasons, and capability bits.

/// Numeric protocol error codes carried in ERROR messages.
///
/// The codes are fixed by the protocol; the accompanying text is free-form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Header byte 0 was not the supported version
    InvalidVersion = 0x0001,
    /// Message type outside defined and reserved ranges
    InvalidMessageType = 0x0002,
    /// PQ or classical signature verification failed, or HMAC proof mismatch
    InvalidSignature = 0x0003,
    /// Initial handshake or re-handshake exceeded its deadline
    HandshakeTimeout = 0x0004,
    /// AEAD tag mismatch on a DATA_FRAME
    DecryptionFailure = 0x0005,
    /// Counter inside replay window with bit set, or timestamp skew > 30 s
    ReplayAttack = 0x0006,
    /// Requested capability bit not implemented
    UnsupportedFeature = 0x0007,
    /// Relay inbound rate ceiling tripped
    RateLimitExceeded = 0x0008,
    /// Implementation bug; peer should reconnect
    InternalServerError = 0x00FF,
}

impl ErrorCode {
    /// Parse a wire code
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::InvalidVersion),
            0x0002 => Some(Self::InvalidMessageType),
            0x0003 => Some(Self::InvalidSignature),
            0x0004 => Some(Self::HandshakeTimeout),
            0x0005 => Some(Self::DecryptionFailure),
            0x0006 => Some(Self::ReplayAttack),
            0x0007 => Some(Self::UnsupportedFeature),
            0x0008 => Some(Self::RateLimitExceeded),
            0x00FF => Some(Self::InternalServerError),
            _ => None,
        }
    }
}

/// Close reasons carried in CLOSE messages (separate namespace from errors)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseReason {
    /// Orderly shutdown requested by the application
    NormalShutdown = 0x0000,
    /// No inbound traffic for 3x the heartbeat interval
    IdleTimeout = 0x0001,
    /// Displaced by a newer connection, or operator action
    AdministrativeShutdown = 0x0002,
    /// The peer violated the protocol
    ProtocolViolation = 0x0003,
}

impl CloseReason {
    /// Parse a wire code
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Self::NormalShutdown),
            0x0001 => Some(Self::IdleTimeout),
            0x0002 => Some(Self::AdministrativeShutdown),
            0x0003 => Some(Self::ProtocolViolation),
            _ => None,
        }
    }
}

/// Capability flag field exchanged in RESPONSE and ESTABLISHED.
///
/// Unknown bits must be ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(pub u32);

impl Capabilities {
    /// Multi-hop routing (not implemented by this release)
    pub const MULTI_HOP: u32 = 1 << 0;
    /// Traffic obfuscation (not implemented by this release)
    pub const OBFUSCATION: u32 = 1 << 1;
    /// IPv6 transport
    pub const IPV6: u32 = 1 << 2;
    /// Direct peer-to-peer paths
    pub const DIRECT_P2P: u32 = 1 << 3;

    /// Empty capability set
    #[must_use]
    pub fn none() -> Self {
        Self(0)
    }

    /// Set a capability bit
    #[must_use]
    pub fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }

    /// Check a capability bit
    #[must_use]
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::InvalidVersion,
            ErrorCode::InvalidMessageType,
            ErrorCode::InvalidSignature,
            ErrorCode::HandshakeTimeout,
            ErrorCode::DecryptionFailure,
            ErrorCode::ReplayAttack,
            ErrorCode::UnsupportedFeature,
            ErrorCode::RateLimitExceeded,
            ErrorCode::InternalServerError,
        ] {
            assert_eq!(ErrorCode::from_u16(code as u16), Some(code));
        }
    }

    #[test]
    fn test_unknown_error_code() {
        assert_eq!(ErrorCode::from_u16(0x1234), None);
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::NormalShutdown as u16, 0x0000);
        assert_eq!(CloseReason::IdleTimeout as u16, 0x0001);
        assert_eq!(CloseReason::AdministrativeShutdown as u16, 0x0002);
        assert_eq!(CloseReason::ProtocolViolation as u16, 0x0003);
        assert_eq!(CloseReason::from_u16(0x0004), None);
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::none().with(Capabilities::DIRECT_P2P);
        assert!(caps.has(Capabilities::DIRECT_P2P));
        assert!(!caps.has(Capabilities::MULTI_HOP));
    }
}
