//! ML-DSA-87 post-quantum signatures.
//!
//! Long-term endpoint identities sign with ML-DSA-87 (round-3-compatible
//! Dilithium5 parameters). The 32-byte endpoint identifier is the SHA-256
//! digest of the public key.

use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::{PQ_PUBLIC_KEY_SIZE, PQ_SECRET_KEY_SIZE, PQ_SIGNATURE_SIZE};

/// ML-DSA-87 public key (2592 bytes)
#[derive(Clone)]
pub struct PqVerifyingKey(dilithium5::PublicKey);

/// ML-DSA-87 detached signature (4595 bytes)
#[derive(Clone)]
pub struct PqSignature(dilithium5::DetachedSignature);

/// ML-DSA-87 keypair holding the long-term signing secret
pub struct PqKeyPair {
    public: dilithium5::PublicKey,
    secret: dilithium5::SecretKey,
}

impl PqKeyPair {
    /// Generate a fresh keypair from the OS CSPRNG
    #[must_use]
    pub fn generate() -> Self {
        let (public, secret) = dilithium5::keypair();
        Self { public, secret }
    }

    /// Restore a keypair from its serialized halves
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] or
    /// [`CryptoError::InvalidSecretKey`] if either blob fails to parse or
    /// has the wrong size.
    pub fn from_bytes(public: &[u8], secret: &[u8]) -> Result<Self, CryptoError> {
        if public.len() != PQ_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }
        if secret.len() != PQ_SECRET_KEY_SIZE {
            return Err(CryptoError::InvalidSecretKey);
        }

        let public =
            dilithium5::PublicKey::from_bytes(public).map_err(|_| CryptoError::InvalidPublicKey)?;
        let secret =
            dilithium5::SecretKey::from_bytes(secret).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { public, secret })
    }

    /// Sign a message, producing a detached 4595-byte signature
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> PqSignature {
        PqSignature(dilithium5::detached_sign(message, &self.secret))
    }

    /// The public half
    #[must_use]
    pub fn verifying_key(&self) -> PqVerifyingKey {
        PqVerifyingKey(self.public.clone())
    }

    /// Serialize the secret half (identity store persistence only)
    #[must_use]
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.secret.as_bytes().to_vec()
    }
}

impl PqVerifyingKey {
    /// Import from raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] on a size or parse failure.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != PQ_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }
        dilithium5::PublicKey::from_bytes(slice)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Raw public key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Derive the 32-byte endpoint identifier from this key
    #[must_use]
    pub fn endpoint_id(&self) -> [u8; 32] {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        id
    }

    /// Verify a detached signature on a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message under this key.
    pub fn verify(&self, message: &[u8], signature: &PqSignature) -> Result<(), CryptoError> {
        dilithium5::verify_detached_signature(&signature.0, message, &self.0)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl PqSignature {
    /// Import from raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] on a size or parse failure.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != PQ_SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        dilithium5::DetachedSignature::from_bytes(slice)
            .map(Self)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = PqKeyPair::generate();
        let signature = keypair.sign(b"authenticate this");

        assert!(keypair.verifying_key().verify(b"authenticate this", &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = PqKeyPair::generate();
        let signature = keypair.sign(b"original");

        assert!(keypair.verifying_key().verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = PqKeyPair::generate();
        let other = PqKeyPair::generate();
        let signature = keypair.sign(b"message");

        assert!(other.verifying_key().verify(b"message", &signature).is_err());
    }

    #[test]
    fn test_pinned_sizes() {
        let keypair = PqKeyPair::generate();
        assert_eq!(keypair.verifying_key().as_bytes().len(), PQ_PUBLIC_KEY_SIZE);
        assert_eq!(keypair.secret_bytes().len(), PQ_SECRET_KEY_SIZE);
        assert_eq!(keypair.sign(b"x").as_bytes().len(), PQ_SIGNATURE_SIZE);
    }

    #[test]
    fn test_keypair_persistence_roundtrip() {
        let keypair = PqKeyPair::generate();
        let restored = PqKeyPair::from_bytes(
            keypair.verifying_key().as_bytes(),
            &keypair.secret_bytes(),
        )
        .unwrap();

        let signature = restored.sign(b"persisted");
        assert!(keypair.verifying_key().verify(b"persisted", &signature).is_ok());
    }

    #[test]
    fn test_endpoint_id_deterministic() {
        let keypair = PqKeyPair::generate();
        let id1 = keypair.verifying_key().endpoint_id();
        let id2 = keypair.verifying_key().endpoint_id();

        assert_eq!(id1, id2);
        assert_ne!(id1, PqKeyPair::generate().verifying_key().endpoint_id());
    }

    #[test]
    fn test_truncated_key_rejected() {
        let keypair = PqKeyPair::generate();
        let bytes = keypair.verifying_key().as_bytes().to_vec();

        assert!(PqVerifyingKey::from_slice(&bytes[..bytes.len() - 1]).is_err());
    }
}
