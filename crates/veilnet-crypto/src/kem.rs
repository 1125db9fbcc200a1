//! ML-KEM-1024 key encapsulation.
//!
//! The post-quantum half of the hybrid key agreement. A fresh KEM keypair is
//! generated per handshake; the responder encapsulates against the
//! initiator's public key and returns the 1568-byte ciphertext.

use pqcrypto_kyber::kyber1024;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::{KEM_CIPHERTEXT_SIZE, KEM_PUBLIC_KEY_SIZE, KEM_SHARED_SECRET_SIZE};

/// ML-KEM-1024 public key (1568 bytes)
#[derive(Clone)]
pub struct KemPublicKey([u8; KEM_PUBLIC_KEY_SIZE]);

/// ML-KEM-1024 ciphertext (1568 bytes)
#[derive(Clone)]
pub struct KemCiphertext([u8; KEM_CIPHERTEXT_SIZE]);

/// ML-KEM-1024 shared secret (32 bytes), zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KemSharedSecret([u8; KEM_SHARED_SECRET_SIZE]);

/// An ephemeral ML-KEM-1024 keypair, generated per handshake
pub struct KemKeyPair {
    public: kyber1024::PublicKey,
    secret: kyber1024::SecretKey,
}

impl KemKeyPair {
    /// Generate a fresh keypair from the OS CSPRNG
    #[must_use]
    pub fn generate() -> Self {
        let (public, secret) = kyber1024::keypair();
        Self { public, secret }
    }

    /// The public half, as sent in HELLO
    #[must_use]
    pub fn public_key(&self) -> KemPublicKey {
        let mut bytes = [0u8; KEM_PUBLIC_KEY_SIZE];
        bytes.copy_from_slice(self.public.as_bytes());
        KemPublicKey(bytes)
    }

    /// Recover the shared secret from a peer's ciphertext
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCiphertext`] if the bytes do not parse.
    pub fn decapsulate(&self, ciphertext: &KemCiphertext) -> Result<KemSharedSecret, CryptoError> {
        let ct = kyber1024::Ciphertext::from_bytes(&ciphertext.0)
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        let ss = kyber1024::decapsulate(&ct, &self.secret);

        let mut bytes = [0u8; KEM_SHARED_SECRET_SIZE];
        bytes.copy_from_slice(ss.as_bytes());
        Ok(KemSharedSecret(bytes))
    }
}

/// Encapsulate against a peer's public key.
///
/// Produces the shared secret kept locally and the ciphertext returned to
/// the peer in CHALLENGE (or PEER_KEY).
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the key bytes do not parse.
pub fn encapsulate(peer: &KemPublicKey) -> Result<(KemSharedSecret, KemCiphertext), CryptoError> {
    let pk =
        kyber1024::PublicKey::from_bytes(&peer.0).map_err(|_| CryptoError::InvalidPublicKey)?;
    let (ss, ct) = kyber1024::encapsulate(&pk);

    let mut secret = [0u8; KEM_SHARED_SECRET_SIZE];
    secret.copy_from_slice(ss.as_bytes());

    let mut ciphertext = [0u8; KEM_CIPHERTEXT_SIZE];
    ciphertext.copy_from_slice(ct.as_bytes());

    Ok((KemSharedSecret(secret), KemCiphertext(ciphertext)))
}

impl KemPublicKey {
    /// Import from raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] on a size mismatch.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEM_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEM_PUBLIC_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEM_PUBLIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEM_PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl KemCiphertext {
    /// Import from raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] on a size mismatch.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEM_CIPHERTEXT_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEM_CIPHERTEXT_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEM_CIPHERTEXT_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Raw ciphertext bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEM_CIPHERTEXT_SIZE] {
        &self.0
    }
}

impl KemSharedSecret {
    /// Shared secret bytes for the KDF
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEM_SHARED_SECRET_SIZE] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encapsulate_decapsulate_agreement() {
        let keypair = KemKeyPair::generate();
        let (sender_secret, ciphertext) = encapsulate(&keypair.public_key()).unwrap();
        let receiver_secret = keypair.decapsulate(&ciphertext).unwrap();

        assert_eq!(sender_secret.as_bytes(), receiver_secret.as_bytes());
    }

    #[test]
    fn test_public_key_size() {
        let keypair = KemKeyPair::generate();
        assert_eq!(keypair.public_key().as_bytes().len(), 1568);
    }

    #[test]
    fn test_ciphertext_size() {
        let keypair = KemKeyPair::generate();
        let (_, ciphertext) = encapsulate(&keypair.public_key()).unwrap();
        assert_eq!(ciphertext.as_bytes().len(), 1568);
    }

    #[test]
    fn test_public_key_from_slice_wrong_size() {
        assert!(KemPublicKey::from_slice(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_corrupted_ciphertext_differs() {
        // ML-KEM decapsulation is implicit-rejection: a corrupted ciphertext
        // yields a pseudorandom secret rather than an error.
        let keypair = KemKeyPair::generate();
        let (sender_secret, ciphertext) = encapsulate(&keypair.public_key()).unwrap();

        let mut corrupted = *ciphertext.as_bytes();
        corrupted[0] ^= 0xFF;
        let corrupted = KemCiphertext::from_slice(&corrupted).unwrap();

        let receiver_secret = keypair.decapsulate(&corrupted).unwrap();
        assert_ne!(sender_secret.as_bytes(), receiver_secret.as_bytes());
    }
}
