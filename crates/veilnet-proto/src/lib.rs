//! # VEILNET Wire Protocol
//!
//! Framed binary messages carried as WebSocket binary frames. Every message
//! is an 8-byte fixed header followed by a typed payload:
//!
//! ```text
//! +---------+----------+-----------+--------------+=============+
//! | version | msg type |   flags   | payload len  |   payload   |
//! |   u8    |    u8    | u16 (BE)  |   u32 (BE)   |             |
//! +---------+----------+-----------+--------------+=============+
//! ```
//!
//! All multi-byte integers are big-endian. Fixed-size cryptographic blobs
//! are placed in declared order with no framing between them; variable-size
//! fields carry a 4-byte big-endian length prefix. Timestamps are 64-bit
//! nanoseconds since the Unix epoch.
//!
//! Message type codes, error codes, and close reasons are contractual and
//! must match across implementations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codes;
pub mod error;
pub mod message;
pub mod payload;
mod wire;

pub use codes::{Capabilities, CloseReason, ErrorCode};
pub use error::CodecError;
pub use message::{Decoded, Message, MessageFlags, MessageHeader, MessageType};

/// Protocol version carried in byte 0 of every header
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum total message size (header + payload)
pub const MAX_MESSAGE_SIZE: usize = 65_535;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;
