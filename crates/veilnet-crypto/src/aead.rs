//! ChaCha20-Poly1305 AEAD frame encryption.
//!
//! Every frame is sealed under a 12-byte nonce built from the 64-bit frame
//! counter and a per-direction 6-byte salt: `counter[2..8] || salt`. The
//! counter never exceeds 2^48, so the truncation is lossless; crossing that
//! boundary requires a re-key, which regenerates the salts.

use crate::error::CryptoError;
use crate::{AEAD_NONCE_SIZE, COUNTER_LIMIT, NONCE_SALT_SIZE};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;

/// Build a frame nonce from a counter and a per-direction salt.
///
/// # Errors
///
/// Returns [`CryptoError::NonceOverflow`] if the counter has reached 2^48.
pub fn build_nonce(
    counter: u64,
    salt: &[u8; NONCE_SALT_SIZE],
) -> Result<[u8; AEAD_NONCE_SIZE], CryptoError> {
    if counter >= COUNTER_LIMIT {
        return Err(CryptoError::NonceOverflow);
    }

    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[..6].copy_from_slice(&counter.to_be_bytes()[2..8]);
    nonce[6..].copy_from_slice(salt);
    Ok(nonce)
}

/// AEAD cipher for frame encryption, bound to one direction's key
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
}

impl FrameCipher {
    /// Create a new cipher with the given 32-byte key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt a frame under `counter` and `salt`.
    ///
    /// Returns `ciphertext || tag`. Associated data is empty: the frame
    /// counter travels in cleartext next to the ciphertext and is bound to
    /// it through the nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] when the counter space is
    /// exhausted, [`CryptoError::EncryptionFailed`] on cipher failure.
    pub fn seal(
        &self,
        counter: u64,
        salt: &[u8; NONCE_SALT_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = build_nonce(counter, salt)?;

        self.cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt `ciphertext || tag` under `counter` and `salt`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on tag mismatch. The caller
    /// drops the frame and keeps the session alive.
    pub fn open(
        &self,
        counter: u64,
        salt: &[u8; NONCE_SALT_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = build_nonce(counter, salt)?;

        self.cipher
            .decrypt(
                (&nonce).into(),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
