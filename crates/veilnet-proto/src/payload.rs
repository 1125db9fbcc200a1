//! Typed message payloads.
//!
//! Field order within each payload is contractual. Fixed-size cryptographic
//! blobs are written back-to-back; variable-size fields (certificates, peer
//! key material that may be absent) carry 4-byte big-endian length prefixes.

use veilnet_crypto::{
    ED25519_SIGNATURE_SIZE, KEM_CIPHERTEXT_SIZE, KEM_PUBLIC_KEY_SIZE, PQ_PUBLIC_KEY_SIZE,
    PQ_SIGNATURE_SIZE,
};

use crate::error::CodecError;
use crate::wire::{put_lp_bytes, put_u16, put_u32, put_u64, Reader};

/// HELLO: initiate a handshake.
///
/// Carries the initiator's identity, its ephemeral hybrid public keys, and
/// dual signatures over `client_id || kem_public || ecdh_public || timestamp`.
/// The long-term verify keys travel at the end; the receiver checks that
/// `client_id == SHA-256(pq_public)` before trusting them.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    /// Initiator's 32-byte endpoint identifier
    pub client_id: [u8; 32],
    /// Ephemeral ML-KEM-1024 public key
    pub kem_public: [u8; KEM_PUBLIC_KEY_SIZE],
    /// Ephemeral X25519 public key
    pub ecdh_public: [u8; 32],
    /// ML-DSA-87 signature over the signed tuple
    pub pq_signature: [u8; PQ_SIGNATURE_SIZE],
    /// Ed25519 signature over the signed tuple
    pub ed_signature: [u8; ED25519_SIGNATURE_SIZE],
    /// Nanoseconds since the Unix epoch at send time
    pub timestamp_ns: u64,
    /// Long-term ML-DSA-87 verify key
    pub pq_public: [u8; PQ_PUBLIC_KEY_SIZE],
    /// Long-term Ed25519 verify key
    pub ed_public: [u8; 32],
}

impl Hello {
    /// The byte string both signatures cover.
    #[must_use]
    pub fn signed_tuple(
        client_id: &[u8; 32],
        kem_public: &[u8; KEM_PUBLIC_KEY_SIZE],
        ecdh_public: &[u8; 32],
        timestamp_ns: u64,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + KEM_PUBLIC_KEY_SIZE + 32 + 8);
        out.extend_from_slice(client_id);
        out.extend_from_slice(kem_public);
        out.extend_from_slice(ecdh_public);
        out.extend_from_slice(&timestamp_ns.to_be_bytes());
        out
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_id);
        buf.extend_from_slice(&self.kem_public);
        buf.extend_from_slice(&self.ecdh_public);
        buf.extend_from_slice(&self.pq_signature);
        buf.extend_from_slice(&self.ed_signature);
        put_u64(buf, self.timestamp_ns);
        buf.extend_from_slice(&self.pq_public);
        buf.extend_from_slice(&self.ed_public);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            client_id: r.array()?,
            kem_public: r.array()?,
            ecdh_public: r.array()?,
            pq_signature: r.array()?,
            ed_signature: r.array()?,
            timestamp_ns: r.u64()?,
            pq_public: r.array()?,
            ed_public: r.array()?,
        })
    }
}

/// CHALLENGE: the responder's half of the hybrid exchange.
///
/// Signed tuple: `relay_id || session_id || kem_ciphertext || ecdh_public ||
/// nonce || timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    /// Responder's 32-byte endpoint identifier
    pub relay_id: [u8; 32],
    /// Session identifier minted by the responder
    pub session_id: [u8; 16],
    /// ML-KEM-1024 ciphertext against the initiator's HELLO key
    pub kem_ciphertext: [u8; KEM_CIPHERTEXT_SIZE],
    /// Responder's ephemeral X25519 public key
    pub ecdh_public: [u8; 32],
    /// Fresh nonce the initiator must MAC in RESPONSE
    pub nonce: [u8; 24],
    /// ML-DSA-87 signature over the signed tuple
    pub pq_signature: [u8; PQ_SIGNATURE_SIZE],
    /// Ed25519 signature over the signed tuple
    pub ed_signature: [u8; ED25519_SIGNATURE_SIZE],
    /// Nanoseconds since the Unix epoch at send time
    pub timestamp_ns: u64,
    /// Long-term ML-DSA-87 verify key
    pub pq_public: [u8; PQ_PUBLIC_KEY_SIZE],
    /// Long-term Ed25519 verify key
    pub ed_public: [u8; 32],
}

impl Challenge {
    /// The byte string both signatures cover.
    #[must_use]
    pub fn signed_tuple(
        relay_id: &[u8; 32],
        session_id: &[u8; 16],
        kem_ciphertext: &[u8; KEM_CIPHERTEXT_SIZE],
        ecdh_public: &[u8; 32],
        nonce: &[u8; 24],
        timestamp_ns: u64,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 16 + KEM_CIPHERTEXT_SIZE + 32 + 24 + 8);
        out.extend_from_slice(relay_id);
        out.extend_from_slice(session_id);
        out.extend_from_slice(kem_ciphertext);
        out.extend_from_slice(ecdh_public);
        out.extend_from_slice(nonce);
        out.extend_from_slice(&timestamp_ns.to_be_bytes());
        out
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.relay_id);
        buf.extend_from_slice(&self.session_id);
        buf.extend_from_slice(&self.kem_ciphertext);
        buf.extend_from_slice(&self.ecdh_public);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.pq_signature);
        buf.extend_from_slice(&self.ed_signature);
        put_u64(buf, self.timestamp_ns);
        buf.extend_from_slice(&self.pq_public);
        buf.extend_from_slice(&self.ed_public);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            relay_id: r.array()?,
            session_id: r.array()?,
            kem_ciphertext: r.array()?,
            ecdh_public: r.array()?,
            nonce: r.array()?,
            pq_signature: r.array()?,
            ed_signature: r.array()?,
            timestamp_ns: r.u64()?,
            pq_public: r.array()?,
            ed_public: r.array()?,
        })
    }
}

/// RESPONSE: proof of possession of the derived proof key.
///
/// Also advertises the client's capabilities, its direct-path listener port,
/// and its direct-path certificate with the long-term PQ signature over the
/// certificate's DER encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Session identifier from CHALLENGE
    pub session_id: [u8; 16],
    /// `HMAC-SHA-256(proof_key, nonce)`
    pub proof: [u8; 32],
    /// Capability flag field; unknown bits are ignored
    pub capabilities: u32,
    /// Direct-path listener port, 0 when direct paths are disabled
    pub direct_port: u16,
    /// Direct-path certificate DER; may be empty
    pub certificate: Vec<u8>,
    /// ML-DSA-87 signature over the certificate DER; may be empty
    pub certificate_sig: Vec<u8>,
}

impl Response {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id);
        buf.extend_from_slice(&self.proof);
        put_u32(buf, self.capabilities);
        put_u16(buf, self.direct_port);
        put_lp_bytes(buf, &self.certificate);
        put_lp_bytes(buf, &self.certificate_sig);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: r.array()?,
            proof: r.array()?,
            capabilities: r.u32()?,
            direct_port: r.u16()?,
            certificate: r.lp_bytes()?,
            certificate_sig: r.lp_bytes()?,
        })
    }
}

/// Peer metadata published by the relay.
///
/// Everything may be zeroed/empty when no counterpart is connected yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerBlock {
    /// Peer public IP; IPv4 occupies the low 4 bytes
    pub ip: [u8; 16],
    /// Peer direct-path port (advertised listener port, else observed source port)
    pub port: u16,
    /// Whether the peer advertised direct-path support
    pub supports_direct: bool,
    /// Peer direct-path certificate DER
    pub certificate: Vec<u8>,
    /// Peer's ML-DSA-87 signature over the certificate DER
    pub certificate_sig: Vec<u8>,
    /// Peer long-term ML-DSA-87 verify key
    pub pq_public: Vec<u8>,
    /// Peer long-term Ed25519 verify key
    pub ed_public: Vec<u8>,
    /// Peer ephemeral ML-KEM-1024 public key (from its HELLO)
    pub kem_public: Vec<u8>,
    /// Peer ephemeral X25519 public key (from its HELLO)
    pub ecdh_public: Vec<u8>,
}

impl PeerBlock {
    /// True when the block carries no counterpart information.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ip == [0u8; 16] && self.port == 0 && self.pq_public.is_empty()
    }

    /// Encode an IP address into the 16-byte field (IPv4 occupies the low
    /// 4 bytes, the rest zeroed).
    pub fn set_ip(&mut self, addr: std::net::IpAddr) {
        self.ip = [0u8; 16];
        match addr {
            std::net::IpAddr::V4(v4) => self.ip[12..].copy_from_slice(&v4.octets()),
            std::net::IpAddr::V6(v6) => self.ip = v6.octets(),
        }
    }

    /// The advertised direct address, if the block carries one.
    #[must_use]
    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        if self.port == 0 || self.ip == [0u8; 16] {
            return None;
        }
        let ip = if self.ip[..12].iter().all(|&b| b == 0) {
            let mut v4 = [0u8; 4];
            v4.copy_from_slice(&self.ip[12..]);
            std::net::IpAddr::V4(std::net::Ipv4Addr::from(v4))
        } else {
            std::net::IpAddr::V6(std::net::Ipv6Addr::from(self.ip))
        };
        Some(std::net::SocketAddr::new(ip, self.port))
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ip);
        put_u16(buf, self.port);
        buf.push(u8::from(self.supports_direct));
        put_lp_bytes(buf, &self.certificate);
        put_lp_bytes(buf, &self.certificate_sig);
        put_lp_bytes(buf, &self.pq_public);
        put_lp_bytes(buf, &self.ed_public);
        put_lp_bytes(buf, &self.kem_public);
        put_lp_bytes(buf, &self.ecdh_public);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            ip: r.array()?,
            port: r.u16()?,
            supports_direct: r.u8()? != 0,
            certificate: r.lp_bytes()?,
            certificate_sig: r.lp_bytes()?,
            pq_public: r.lp_bytes()?,
            ed_public: r.lp_bytes()?,
            kem_public: r.lp_bytes()?,
            ecdh_public: r.lp_bytes()?,
        })
    }
}

/// ESTABLISHED: session confirmation with negotiated parameters and the
/// counterpart's metadata (zeroed when the counterpart has not joined yet).
#[derive(Debug, Clone, PartialEq)]
pub struct Established {
    /// Session identifier
    pub session_id: [u8; 16],
    /// Responder capability flags
    pub capabilities: u32,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u32,
    /// Negotiated MTU for the virtual device payload
    pub mtu: u16,
    /// Key rotation interval in seconds
    pub key_rotation_interval_secs: u32,
    /// Counterpart metadata
    pub peer: PeerBlock,
}

impl Established {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id);
        put_u32(buf, self.capabilities);
        put_u32(buf, self.heartbeat_interval_secs);
        put_u16(buf, self.mtu);
        put_u32(buf, self.key_rotation_interval_secs);
        self.peer.encode_into(buf);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: r.array()?,
            capabilities: r.u32()?,
            heartbeat_interval_secs: r.u32()?,
            mtu: r.u16()?,
            key_rotation_interval_secs: r.u32()?,
            peer: PeerBlock::decode(r)?,
        })
    }
}

/// HEARTBEAT and HEARTBEAT_ACK payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Sender clock, for RTT measurement on the ACK
    pub timestamp_ns: u64,
}

impl Heartbeat {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.timestamp_ns);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            timestamp_ns: r.u64()?,
        })
    }
}

/// ERROR: numeric code plus short free-form text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Protocol error code (see [`crate::ErrorCode`])
    pub code: u16,
    /// Free-form description
    pub message: String,
}

impl ErrorMessage {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.code);
        put_lp_bytes(buf, self.message.as_bytes());
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            code: r.u16()?,
            message: String::from_utf8_lossy(&r.lp_bytes()?).into_owned(),
        })
    }
}

/// CLOSE: graceful shutdown with a reason code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    /// Close reason code (see [`crate::CloseReason`])
    pub reason: u16,
    /// Free-form description
    pub message: String,
}

impl Close {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.reason);
        put_lp_bytes(buf, self.message.as_bytes());
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            reason: r.u16()?,
            message: String::from_utf8_lossy(&r.lp_bytes()?).into_owned(),
        })
    }
}

/// DATA_FRAME: an encrypted Ethernet frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Monotonic frame counter; also the high half of the AEAD nonce
    pub counter: u64,
    /// `ciphertext || tag`
    pub ciphertext: Vec<u8>,
}

impl DataFrame {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.counter);
        buf.extend_from_slice(&self.ciphertext);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            counter: r.u64()?,
            ciphertext: r.rest().to_vec(),
        })
    }
}

/// PEER_INFO: counterpart metadata pushed by the relay to a client that was
/// already established when the counterpart joined.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Session identifier
    pub session_id: [u8; 16],
    /// Counterpart metadata
    pub peer: PeerBlock,
}

impl PeerInfo {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id);
        self.peer.encode_into(buf);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: r.array()?,
            peer: PeerBlock::decode(r)?,
        })
    }
}

/// PEER_KEY: end-to-end pair key establishment, relayed opaquely.
///
/// Sent by the second-joining client after it learns the counterpart's
/// ephemeral public keys. Signed tuple: `session_id || kem_ciphertext ||
/// ecdh_public || timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerKey {
    /// Session identifier shared by the pair
    pub session_id: [u8; 16],
    /// ML-KEM-1024 ciphertext against the counterpart's HELLO key
    pub kem_ciphertext: [u8; KEM_CIPHERTEXT_SIZE],
    /// Sender's ephemeral X25519 public key
    pub ecdh_public: [u8; 32],
    /// Nanoseconds since the Unix epoch at send time
    pub timestamp_ns: u64,
    /// ML-DSA-87 signature over the signed tuple
    pub pq_signature: [u8; PQ_SIGNATURE_SIZE],
    /// Ed25519 signature over the signed tuple
    pub ed_signature: [u8; ED25519_SIGNATURE_SIZE],
}

impl PeerKey {
    /// The byte string both signatures cover.
    #[must_use]
    pub fn signed_tuple(
        session_id: &[u8; 16],
        kem_ciphertext: &[u8; KEM_CIPHERTEXT_SIZE],
        ecdh_public: &[u8; 32],
        timestamp_ns: u64,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + KEM_CIPHERTEXT_SIZE + 32 + 8);
        out.extend_from_slice(session_id);
        out.extend_from_slice(kem_ciphertext);
        out.extend_from_slice(ecdh_public);
        out.extend_from_slice(&timestamp_ns.to_be_bytes());
        out
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id);
        buf.extend_from_slice(&self.kem_ciphertext);
        buf.extend_from_slice(&self.ecdh_public);
        put_u64(buf, self.timestamp_ns);
        buf.extend_from_slice(&self.pq_signature);
        buf.extend_from_slice(&self.ed_signature);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: r.array()?,
            kem_ciphertext: r.array()?,
            ecdh_public: r.array()?,
            timestamp_ns: r.u64()?,
            pq_signature: r.array()?,
            ed_signature: r.array()?,
        })
    }
}

#[cfg(test)]
mod peer_block_tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    #[test]
    fn test_ipv4_roundtrip() {
        let mut block = PeerBlock::default();
        block.set_ip(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        block.port = 40123;

        assert_eq!(
            block.socket_addr(),
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 40123))
        );
        assert_eq!(&block.ip[..12], &[0u8; 12]);
    }

    #[test]
    fn test_ipv6_roundtrip() {
        let v6: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let mut block = PeerBlock::default();
        block.set_ip(IpAddr::V6(v6));
        block.port = 443;

        assert_eq!(block.socket_addr(), Some(SocketAddr::new(IpAddr::V6(v6), 443)));
    }

    #[test]
    fn test_zeroed_block_has_no_addr() {
        let block = PeerBlock::default();
        assert_eq!(block.socket_addr(), None);
        assert!(block.is_empty());
    }
}

/// REHANDSHAKE_REQUEST: first message of the direct-path key confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RehandshakeRequest {
    /// Session identifier; must match the receiver's current session
    pub session_id: [u8; 16],
    /// Fresh random challenge
    pub challenge: [u8; 32],
    /// Nanoseconds since the Unix epoch at send time
    pub timestamp_ns: u64,
}

impl RehandshakeRequest {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id);
        buf.extend_from_slice(&self.challenge);
        put_u64(buf, self.timestamp_ns);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: r.array()?,
            challenge: r.array()?,
            timestamp_ns: r.u64()?,
        })
    }
}

/// REHANDSHAKE_RESPONSE: proof over the challenge plus a counter-challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RehandshakeResponse {
    /// Session identifier
    pub session_id: [u8; 16],
    /// `HMAC-SHA-256(responder.tx_key, challenge)`
    pub proof: [u8; 32],
    /// Fresh counter-challenge for the initiator to prove
    pub counter_challenge: [u8; 32],
    /// Nanoseconds since the Unix epoch at send time
    pub timestamp_ns: u64,
}

impl RehandshakeResponse {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id);
        buf.extend_from_slice(&self.proof);
        buf.extend_from_slice(&self.counter_challenge);
        put_u64(buf, self.timestamp_ns);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: r.array()?,
            proof: r.array()?,
            counter_challenge: r.array()?,
            timestamp_ns: r.u64()?,
        })
    }
}

/// REHANDSHAKE_COMPLETE: proof over the counter-challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RehandshakeComplete {
    /// Session identifier
    pub session_id: [u8; 16],
    /// `HMAC-SHA-256(initiator.tx_key, counter_challenge)`
    pub proof: [u8; 32],
    /// Nanoseconds since the Unix epoch at send time
    pub timestamp_ns: u64,
}

impl RehandshakeComplete {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id);
        buf.extend_from_slice(&self.proof);
        put_u64(buf, self.timestamp_ns);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: r.array()?,
            proof: r.array()?,
            timestamp_ns: r.u64()?,
        })
    }
}
