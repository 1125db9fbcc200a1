//! # VEILNET Crypto
//!
//! Cryptographic primitives for the VEILNET protocol.
//!
//! This crate provides:
//! - ML-KEM-1024 key encapsulation for post-quantum key agreement
//! - ML-DSA-87 post-quantum signatures for long-term identities
//! - X25519 and Ed25519 classical counterparts (hybrid construction)
//! - `ChaCha20-Poly1305` AEAD for frame encryption
//! - HKDF-SHA-256 session key derivation, HMAC-SHA-256 handshake proofs
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | PQ KEM | ML-KEM-1024 | 1568 B public key / ciphertext, 32 B secret |
//! | PQ Signatures | ML-DSA-87 | 2592 B public key, 4595 B signature |
//! | Classical KEM | X25519 | run in parallel with the PQ KEM |
//! | Classical Signatures | Ed25519 | 64 B signatures |
//! | AEAD | ChaCha20-Poly1305 | 12 B nonce = 6 B counter + 6 B salt |
//! | KDF | HKDF-SHA-256 | direction-tagged labels |
//! | MAC | HMAC-SHA-256 | handshake proof values |
//!
//! The hybrid construction feeds both the ML-KEM and X25519 shared secrets
//! into HKDF, so compromise of either scheme alone does not recover session
//! keys; likewise every handshake message carries both an ML-DSA-87 and an
//! Ed25519 signature.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod ecdh;
pub mod error;
pub mod kdf;
pub mod kem;
pub mod mac;
pub mod pq_sign;
pub mod random;
pub mod sign;

pub use error::CryptoError;
pub use kdf::{KeyRole, SessionKeySet};

/// ML-KEM-1024 public key size
pub const KEM_PUBLIC_KEY_SIZE: usize = 1568;

/// ML-KEM-1024 ciphertext size
pub const KEM_CIPHERTEXT_SIZE: usize = 1568;

/// ML-KEM-1024 shared secret size
pub const KEM_SHARED_SECRET_SIZE: usize = 32;

/// ML-DSA-87 public key size
pub const PQ_PUBLIC_KEY_SIZE: usize = 2592;

/// ML-DSA-87 secret key size
pub const PQ_SECRET_KEY_SIZE: usize = 4864;

/// ML-DSA-87 signature size
///
/// Pinned per release: this is the round-3-compatible size produced by
/// `pqcrypto-dilithium`'s `dilithium5` parameter set.
pub const PQ_SIGNATURE_SIZE: usize = 4595;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// ChaCha20-Poly1305 key size
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const AEAD_NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 authentication tag size
pub const AEAD_TAG_SIZE: usize = 16;

/// Per-direction nonce salt size (the low half of every nonce)
pub const NONCE_SALT_SIZE: usize = 6;

/// Highest frame counter before the 6-byte nonce prefix would wrap.
///
/// Senders must re-key before crossing it; `aead::build_nonce` refuses
/// counters at or past this value.
pub const COUNTER_LIMIT: u64 = 1 << 48;
