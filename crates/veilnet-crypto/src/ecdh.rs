//! X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! The classical half of the hybrid key agreement. Run in parallel with the
//! ML-KEM encapsulation; both shared secrets feed the session KDF.

use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct EcdhSecretKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EcdhPublicKey(x25519_dalek::PublicKey);

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct EcdhSharedSecret(x25519_dalek::SharedSecret);

impl EcdhSecretKey {
    /// Generate a new random private key with RFC 7748 clamping.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> EcdhPublicKey {
        EcdhPublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DegenerateSharedSecret`] if the peer's public
    /// key is a low-order point.
    pub fn exchange(&self, peer_public: &EcdhPublicKey) -> Result<EcdhSharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer_public.0);

        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::DegenerateSharedSecret);
        }

        Ok(EcdhSharedSecret(shared))
    }
}

impl EcdhPublicKey {
    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }
}

impl EcdhSharedSecret {
    /// Get shared secret bytes for the KDF.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_key_exchange_agreement() {
        let alice = EcdhSecretKey::generate(&mut OsRng);
        let bob = EcdhSecretKey::generate(&mut OsRng);

        let alice_shared = alice.exchange(&bob.public_key()).unwrap();
        let bob_shared = bob.exchange(&alice.public_key()).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_public_key_roundtrip() {
        let secret = EcdhSecretKey::generate(&mut OsRng);
        let public = secret.public_key();

        let recovered = EcdhPublicKey::from_bytes(public.to_bytes());
        assert_eq!(public, recovered);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let secret = EcdhSecretKey::generate(&mut OsRng);
        let low_order = EcdhPublicKey::from_bytes([0u8; 32]);

        assert!(matches!(
            secret.exchange(&low_order),
            Err(CryptoError::DegenerateSharedSecret)
        ));
    }
}
