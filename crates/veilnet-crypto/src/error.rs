//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Public key bytes did not parse
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Secret key bytes did not parse
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// KEM ciphertext bytes did not parse
    #[error("invalid KEM ciphertext")]
    InvalidCiphertext,

    /// Signature malformed or does not authenticate the message
    #[error("invalid signature")]
    InvalidSignature,

    /// X25519 exchange produced a low-order result
    #[error("degenerate Diffie-Hellman result")]
    DegenerateSharedSecret,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Frame counter exhausted the 48-bit nonce space
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,
}
