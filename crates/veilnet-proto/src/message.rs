//! Message envelope: header, type codes, flags, and the top-level codec.

use crate::error::CodecError;
use crate::payload::{
    Challenge, Close, DataFrame, ErrorMessage, Established, Heartbeat, Hello, PeerInfo, PeerKey,
    RehandshakeComplete, RehandshakeRequest, RehandshakeResponse, Response,
};
use crate::wire::{put_u16, put_u32, Reader};
use crate::{HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// Message type codes. Contractual; must match across implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Initiate handshake
    Hello = 0x01,
    /// KEM ciphertext + signed challenge
    Challenge = 0x02,
    /// Proof of possession of the shared secret
    Response = 0x03,
    /// Session confirmation + negotiated parameters + peer info
    Established = 0x04,
    /// Keepalive
    Heartbeat = 0x05,
    /// Keepalive reply
    HeartbeatAck = 0x06,
    /// Numeric error code + short text
    Error = 0x0E,
    /// Graceful shutdown with reason
    Close = 0x0F,
    /// Counter + AEAD-encrypted Ethernet frame
    DataFrame = 0x10,
    /// Relay pushes counterpart metadata (management range)
    PeerInfo = 0x20,
    /// End-to-end pair key material, relayed opaquely (management range)
    PeerKey = 0x21,
    /// Begin direct-path key confirmation
    RehandshakeRequest = 0x30,
    /// Confirm + counter-challenge
    RehandshakeResponse = 0x31,
    /// Confirm counter-challenge
    RehandshakeComplete = 0x32,
}

/// Start of the management message range (ignored when unknown)
pub const MANAGEMENT_RANGE_START: u8 = 0x20;
/// End of the management message range (inclusive)
pub const MANAGEMENT_RANGE_END: u8 = 0x2F;

/// Header flag bits. Unknown bits are preserved on forwarded messages and
/// otherwise ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags(pub u16);

impl MessageFlags {
    /// HELLO is an intra-session rekey rather than initial setup
    pub const KEY_ROTATION: u16 = 0x0001;

    /// Empty flag set
    #[must_use]
    pub fn none() -> Self {
        Self(0)
    }

    /// Set a flag bit
    #[must_use]
    pub fn with(mut self, bit: u16) -> Self {
        self.0 |= bit;
        self
    }

    /// Check a flag bit
    #[must_use]
    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }
}

/// The 8-byte fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol version; always `0x01`
    pub version: u8,
    /// Raw message type code
    pub msg_type: u8,
    /// Flag bits
    pub flags: MessageFlags,
    /// Payload length in bytes
    pub length: u32,
}

impl MessageHeader {
    /// Decode a header from the front of `buf`.
    ///
    /// # Errors
    ///
    /// `TruncatedPayload` if fewer than 8 bytes are available,
    /// `UnsupportedVersion` on a version mismatch, `OversizeMessage` when
    /// the declared total exceeds 65 535 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::TruncatedPayload);
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(buf[0]));
        }

        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let total = HEADER_SIZE + length as usize;
        if total > MAX_MESSAGE_SIZE {
            return Err(CodecError::OversizeMessage(total));
        }

        Ok(Self {
            version: buf[0],
            msg_type: buf[1],
            flags: MessageFlags(u16::from_be_bytes([buf[2], buf[3]])),
            length,
        })
    }
}

/// Outcome of decoding one wire message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A recognized message, with its header flags
    Message {
        /// The decoded message
        message: Message,
        /// Header flag bits (unknown bits preserved)
        flags: MessageFlags,
    },
    /// An unknown code in the management range; skipped with a warning
    IgnoredManagement {
        /// The unrecognized type code
        msg_type: u8,
    },
}

/// A typed wire message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// HELLO (0x01)
    Hello(Hello),
    /// CHALLENGE (0x02)
    Challenge(Box<Challenge>),
    /// RESPONSE (0x03)
    Response(Response),
    /// ESTABLISHED (0x04)
    Established(Established),
    /// HEARTBEAT (0x05)
    Heartbeat(Heartbeat),
    /// HEARTBEAT_ACK (0x06)
    HeartbeatAck(Heartbeat),
    /// ERROR (0x0E)
    Error(ErrorMessage),
    /// CLOSE (0x0F)
    Close(Close),
    /// DATA_FRAME (0x10)
    DataFrame(DataFrame),
    /// PEER_INFO (0x20)
    PeerInfo(PeerInfo),
    /// PEER_KEY (0x21)
    PeerKey(Box<PeerKey>),
    /// REHANDSHAKE_REQUEST (0x30)
    RehandshakeRequest(RehandshakeRequest),
    /// REHANDSHAKE_RESPONSE (0x31)
    RehandshakeResponse(RehandshakeResponse),
    /// REHANDSHAKE_COMPLETE (0x32)
    RehandshakeComplete(RehandshakeComplete),
}

impl Message {
    /// The type code of this message
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::Challenge(_) => MessageType::Challenge,
            Self::Response(_) => MessageType::Response,
            Self::Established(_) => MessageType::Established,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::HeartbeatAck(_) => MessageType::HeartbeatAck,
            Self::Error(_) => MessageType::Error,
            Self::Close(_) => MessageType::Close,
            Self::DataFrame(_) => MessageType::DataFrame,
            Self::PeerInfo(_) => MessageType::PeerInfo,
            Self::PeerKey(_) => MessageType::PeerKey,
            Self::RehandshakeRequest(_) => MessageType::RehandshakeRequest,
            Self::RehandshakeResponse(_) => MessageType::RehandshakeResponse,
            Self::RehandshakeComplete(_) => MessageType::RehandshakeComplete,
        }
    }

    /// Encode with empty flags.
    ///
    /// # Errors
    ///
    /// `OversizeMessage` if the payload exceeds the 65 535-byte ceiling.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.encode_with_flags(MessageFlags::none())
    }

    /// Encode with explicit header flags.
    ///
    /// # Errors
    ///
    /// `OversizeMessage` if the payload exceeds the 65 535-byte ceiling.
    pub fn encode_with_flags(&self, flags: MessageFlags) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 64);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.msg_type() as u8);
        put_u16(&mut buf, flags.0);
        put_u32(&mut buf, 0); // payload length backfilled below

        match self {
            Self::Hello(p) => p.encode_into(&mut buf),
            Self::Challenge(p) => p.encode_into(&mut buf),
            Self::Response(p) => p.encode_into(&mut buf),
            Self::Established(p) => p.encode_into(&mut buf),
            Self::Heartbeat(p) | Self::HeartbeatAck(p) => p.encode_into(&mut buf),
            Self::Error(p) => p.encode_into(&mut buf),
            Self::Close(p) => p.encode_into(&mut buf),
            Self::DataFrame(p) => p.encode_into(&mut buf),
            Self::PeerInfo(p) => p.encode_into(&mut buf),
            Self::PeerKey(p) => p.encode_into(&mut buf),
            Self::RehandshakeRequest(p) => p.encode_into(&mut buf),
            Self::RehandshakeResponse(p) => p.encode_into(&mut buf),
            Self::RehandshakeComplete(p) => p.encode_into(&mut buf),
        }

        let payload_len = buf.len() - HEADER_SIZE;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::OversizeMessage(buf.len()));
        }
        buf[4..8].copy_from_slice(&(payload_len as u32).to_be_bytes());

        Ok(buf)
    }

    /// Decode one complete wire message.
    ///
    /// Unknown type codes in the management range (0x20–0x2F) are reported
    /// as [`Decoded::IgnoredManagement`]; unknown codes elsewhere fail with
    /// `UnknownMessageType`. Trailing bytes beyond the declared payload
    /// length are ignored.
    ///
    /// # Errors
    ///
    /// See [`CodecError`].
    pub fn decode(buf: &[u8]) -> Result<Decoded, CodecError> {
        let header = MessageHeader::decode(buf)?;

        let end = HEADER_SIZE + header.length as usize;
        if buf.len() < end {
            return Err(CodecError::TruncatedPayload);
        }
        let mut r = Reader::new(&buf[HEADER_SIZE..end]);

        let message = match header.msg_type {
            0x01 => Message::Hello(Hello::decode(&mut r)?),
            0x02 => Message::Challenge(Box::new(Challenge::decode(&mut r)?)),
            0x03 => Message::Response(Response::decode(&mut r)?),
            0x04 => Message::Established(Established::decode(&mut r)?),
            0x05 => Message::Heartbeat(Heartbeat::decode(&mut r)?),
            0x06 => Message::HeartbeatAck(Heartbeat::decode(&mut r)?),
            0x0E => Message::Error(ErrorMessage::decode(&mut r)?),
            0x0F => Message::Close(Close::decode(&mut r)?),
            0x10 => Message::DataFrame(DataFrame::decode(&mut r)?),
            0x20 => Message::PeerInfo(PeerInfo::decode(&mut r)?),
            0x21 => Message::PeerKey(Box::new(PeerKey::decode(&mut r)?)),
            0x30 => Message::RehandshakeRequest(RehandshakeRequest::decode(&mut r)?),
            0x31 => Message::RehandshakeResponse(RehandshakeResponse::decode(&mut r)?),
            0x32 => Message::RehandshakeComplete(RehandshakeComplete::decode(&mut r)?),
            code @ MANAGEMENT_RANGE_START..=MANAGEMENT_RANGE_END => {
                return Ok(Decoded::IgnoredManagement { msg_type: code });
            }
            code => return Err(CodecError::UnknownMessageType(code)),
        };

        Ok(Decoded::Message {
            message,
            flags: header.flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PeerBlock;

    fn decode_message(bytes: &[u8]) -> (Message, MessageFlags) {
        match Message::decode(bytes).unwrap() {
            Decoded::Message { message, flags } => (message, flags),
            Decoded::IgnoredManagement { msg_type } => {
                panic!("unexpected ignored management message {msg_type:#04x}")
            }
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let msg = Message::Heartbeat(Heartbeat { timestamp_ns: 42 });
        let bytes = msg.encode().unwrap();

        let header = MessageHeader::decode(&bytes).unwrap();
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.msg_type, 0x05);
        assert_eq!(header.length, 8);
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = Message::Heartbeat(Heartbeat { timestamp_ns: 1 })
            .encode()
            .unwrap();
        bytes[0] = 0x02;

        assert_eq!(
            Message::decode(&bytes),
            Err(CodecError::UnsupportedVersion(0x02))
        );
    }

    #[test]
    fn test_oversize_rejected() {
        let mut bytes = Message::Heartbeat(Heartbeat { timestamp_ns: 1 })
            .encode()
            .unwrap();
        bytes[4..8].copy_from_slice(&(70_000u32).to_be_bytes());

        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::OversizeMessage(_))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = Message::DataFrame(DataFrame {
            counter: 7,
            ciphertext: vec![0u8; 64],
        })
        .encode()
        .unwrap();

        assert_eq!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::TruncatedPayload)
        );
    }

    #[test]
    fn test_unknown_type_reserved_range() {
        let mut bytes = Message::Heartbeat(Heartbeat { timestamp_ns: 1 })
            .encode()
            .unwrap();
        bytes[1] = 0x55;

        assert_eq!(Message::decode(&bytes), Err(CodecError::UnknownMessageType(0x55)));
    }

    #[test]
    fn test_unknown_type_management_range_ignored() {
        let mut bytes = Message::Heartbeat(Heartbeat { timestamp_ns: 1 })
            .encode()
            .unwrap();
        bytes[1] = 0x2A;

        assert_eq!(
            Message::decode(&bytes),
            Ok(Decoded::IgnoredManagement { msg_type: 0x2A })
        );
    }

    #[test]
    fn test_flags_preserved() {
        let msg = Message::Hello(sample_hello());
        let flags = MessageFlags::none().with(MessageFlags::KEY_ROTATION).with(0x8000);
        let bytes = msg.encode_with_flags(flags).unwrap();

        let (_, decoded_flags) = decode_message(&bytes);
        assert!(decoded_flags.has(MessageFlags::KEY_ROTATION));
        assert!(decoded_flags.has(0x8000));
    }

    fn sample_hello() -> Hello {
        Hello {
            client_id: [1u8; 32],
            kem_public: [2u8; 1568],
            ecdh_public: [3u8; 32],
            pq_signature: [4u8; 4595],
            ed_signature: [5u8; 64],
            timestamp_ns: 1_700_000_000_000_000_000,
            pq_public: [6u8; 2592],
            ed_public: [7u8; 32],
        }
    }

    fn sample_peer_block() -> PeerBlock {
        PeerBlock {
            ip: {
                let mut ip = [0u8; 16];
                ip[..4].copy_from_slice(&[10, 0, 0, 7]);
                ip
            },
            port: 51820,
            supports_direct: true,
            certificate: vec![0xDE; 800],
            certificate_sig: vec![0xAD; 4595],
            pq_public: vec![0xBE; 2592],
            ed_public: vec![0xEF; 32],
            kem_public: vec![0x11; 1568],
            ecdh_public: vec![0x22; 32],
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let msg = Message::Hello(sample_hello());
        let (decoded, _) = decode_message(&msg.encode().unwrap());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_challenge_roundtrip() {
        let msg = Message::Challenge(Box::new(Challenge {
            relay_id: [9u8; 32],
            session_id: [8u8; 16],
            kem_ciphertext: [7u8; 1568],
            ecdh_public: [6u8; 32],
            nonce: [5u8; 24],
            pq_signature: [4u8; 4595],
            ed_signature: [3u8; 64],
            timestamp_ns: 123_456_789,
            pq_public: [2u8; 2592],
            ed_public: [1u8; 32],
        }));
        let (decoded, _) = decode_message(&msg.encode().unwrap());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_response_roundtrip_with_empty_cert() {
        let msg = Message::Response(Response {
            session_id: [1u8; 16],
            proof: [2u8; 32],
            capabilities: 0x0000_000C,
            direct_port: 40123,
            certificate: Vec::new(),
            certificate_sig: Vec::new(),
        });
        let (decoded, _) = decode_message(&msg.encode().unwrap());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_established_roundtrip_empty_peer() {
        let msg = Message::Established(Established {
            session_id: [1u8; 16],
            capabilities: 0,
            heartbeat_interval_secs: 30,
            mtu: 1500,
            key_rotation_interval_secs: 3600,
            peer: PeerBlock::default(),
        });
        let (decoded, _) = decode_message(&msg.encode().unwrap());

        if let Message::Established(e) = &decoded {
            assert!(e.peer.is_empty());
        }
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_established_roundtrip_full_peer() {
        let msg = Message::Established(Established {
            session_id: [1u8; 16],
            capabilities: 0x0000_0008,
            heartbeat_interval_secs: 30,
            mtu: 1500,
            key_rotation_interval_secs: 3600,
            peer: sample_peer_block(),
        });
        let (decoded, _) = decode_message(&msg.encode().unwrap());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_peer_info_roundtrip() {
        let msg = Message::PeerInfo(PeerInfo {
            session_id: [3u8; 16],
            peer: sample_peer_block(),
        });
        let (decoded, _) = decode_message(&msg.encode().unwrap());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_peer_key_roundtrip() {
        let msg = Message::PeerKey(Box::new(PeerKey {
            session_id: [3u8; 16],
            kem_ciphertext: [4u8; 1568],
            ecdh_public: [5u8; 32],
            timestamp_ns: 99,
            pq_signature: [6u8; 4595],
            ed_signature: [7u8; 64],
        }));
        let (decoded, _) = decode_message(&msg.encode().unwrap());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let msg = Message::DataFrame(DataFrame {
            counter: 0x0000_1234_5678_9ABC,
            ciphertext: vec![0x42; 1514 + 16],
        });
        let (decoded, _) = decode_message(&msg.encode().unwrap());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_error_and_close_roundtrip() {
        let err = Message::Error(ErrorMessage {
            code: 0x0006,
            message: "replay detected".into(),
        });
        let (decoded, _) = decode_message(&err.encode().unwrap());
        assert_eq!(decoded, err);

        let close = Message::Close(Close {
            reason: 0x0002,
            message: "displaced".into(),
        });
        let (decoded, _) = decode_message(&close.encode().unwrap());
        assert_eq!(decoded, close);
    }

    #[test]
    fn test_rehandshake_roundtrips() {
        let req = Message::RehandshakeRequest(RehandshakeRequest {
            session_id: [1u8; 16],
            challenge: [2u8; 32],
            timestamp_ns: 1,
        });
        let (decoded, _) = decode_message(&req.encode().unwrap());
        assert_eq!(decoded, req);

        let resp = Message::RehandshakeResponse(RehandshakeResponse {
            session_id: [1u8; 16],
            proof: [3u8; 32],
            counter_challenge: [4u8; 32],
            timestamp_ns: 2,
        });
        let (decoded, _) = decode_message(&resp.encode().unwrap());
        assert_eq!(decoded, resp);

        let complete = Message::RehandshakeComplete(RehandshakeComplete {
            session_id: [1u8; 16],
            proof: [5u8; 32],
            timestamp_ns: 3,
        });
        let (decoded, _) = decode_message(&complete.encode().unwrap());
        assert_eq!(decoded, complete);
    }

    #[test]
    fn test_oversize_encode_rejected() {
        let msg = Message::DataFrame(DataFrame {
            counter: 1,
            ciphertext: vec![0u8; MAX_PAYLOAD_SIZE],
        });
        assert!(matches!(msg.encode(), Err(CodecError::OversizeMessage(_))));
    }
}
