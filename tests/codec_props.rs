//! Property tests for the wire codec.

use proptest::prelude::*;
use veilnet_proto::payload::{Close, DataFrame, ErrorMessage, Heartbeat};
use veilnet_proto::{CodecError, Decoded, Message, MessageFlags, MAX_PAYLOAD_SIZE};

proptest! {
    /// decode(encode(m)) = m for data frames of any counter and payload
    #[test]
    fn data_frame_roundtrip(
        counter in any::<u64>(),
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let msg = Message::DataFrame(DataFrame { counter, ciphertext: payload });
        let bytes = msg.encode().unwrap();

        let decoded = Message::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, Decoded::Message { message: msg, flags: MessageFlags::none() });
    }

    /// Error and close texts survive the codec, including empty strings
    #[test]
    fn error_and_close_roundtrip(code in any::<u16>(), text in ".{0,128}") {
        let err = Message::Error(ErrorMessage { code, message: text.clone() });
        let bytes = err.encode().unwrap();
        prop_assert_eq!(
            Message::decode(&bytes).unwrap(),
            Decoded::Message { message: err, flags: MessageFlags::none() }
        );

        let close = Message::Close(Close { reason: code, message: text });
        let bytes = close.encode().unwrap();
        prop_assert_eq!(
            Message::decode(&bytes).unwrap(),
            Decoded::Message { message: close, flags: MessageFlags::none() }
        );
    }

    /// Arbitrary flag bits are preserved end to end
    #[test]
    fn flags_preserved(bits in any::<u16>()) {
        let msg = Message::Heartbeat(Heartbeat { timestamp_ns: 7 });
        let bytes = msg.encode_with_flags(MessageFlags(bits)).unwrap();

        match Message::decode(&bytes).unwrap() {
            Decoded::Message { flags, .. } => prop_assert_eq!(flags.0, bits),
            Decoded::IgnoredManagement { .. } => prop_assert!(false, "heartbeat ignored"),
        }
    }

    /// Decoding never panics on arbitrary bytes
    #[test]
    fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = Message::decode(&bytes);
    }

    /// Truncating a valid message yields TruncatedPayload, never garbage
    #[test]
    fn truncation_detected(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        cut in 1usize..8,
    ) {
        let msg = Message::DataFrame(DataFrame { counter: 1, ciphertext: payload });
        let bytes = msg.encode().unwrap();
        let cut = cut.min(bytes.len() - 8);

        let result = Message::decode(&bytes[..bytes.len() - cut]);
        prop_assert_eq!(result, Err(CodecError::TruncatedPayload));
    }

    /// A declared length over the 65 535-byte ceiling is rejected outright
    #[test]
    fn oversize_header_rejected(extra in 1u32..1_000_000) {
        let msg = Message::Heartbeat(Heartbeat { timestamp_ns: 1 });
        let mut bytes = msg.encode().unwrap();
        let oversize = MAX_PAYLOAD_SIZE as u32 + extra;
        bytes[4..8].copy_from_slice(&oversize.to_be_bytes());

        prop_assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::OversizeMessage(_))
        ));
    }
}
