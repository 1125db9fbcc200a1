//! Ephemeral direct-path certificates.
//!
//! Direct paths do not use CA validation. Each endpoint generates a
//! short-lived self-signed ECDSA P-256 certificate at startup and signs its
//! DER encoding with the long-term ML-DSA-87 key. The certificate and
//! signature travel through the relay; the receiving endpoint verifies the
//! signature under the peer's long-term key and pins the SHA-256
//! fingerprint as the only acceptable peer certificate for direct TLS.
//!
//! Certificates are never persisted: their short lifetime and PQ-signed
//! binding are the security argument.

use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use veilnet_crypto::constant_time;
use veilnet_crypto::pq_sign::{PqSignature, PqVerifyingKey};

use crate::error::DirectPathError;
use crate::identity::Identity;

/// Certificate validity; kept under the 24-hour ceiling
const VALIDITY_HOURS: i64 = 24;

/// An ephemeral direct-path certificate with its PQ binding
pub struct DirectCert {
    /// DER-encoded certificate
    pub cert_der: Vec<u8>,
    /// PKCS#8 DER private key
    pub key_der: Vec<u8>,
    /// ML-DSA-87 signature over `cert_der`
    pub signature: Vec<u8>,
    /// SHA-256 fingerprint of `cert_der`
    pub fingerprint: [u8; 32],
}

impl DirectCert {
    /// Generate a fresh certificate and sign its DER with the identity key.
    ///
    /// # Errors
    ///
    /// [`DirectPathError::Tls`] if certificate generation fails.
    pub fn generate(identity: &Identity) -> Result<Self, DirectPathError> {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| DirectPathError::Tls(e.to_string()))?;

        let mut params = rcgen::CertificateParams::new(vec!["veilnet".to_string()])
            .map_err(|e| DirectPathError::Tls(e.to_string()))?;
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::minutes(5);
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::hours(VALIDITY_HOURS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| DirectPathError::Tls(e.to_string()))?;

        let cert_der = cert.der().to_vec();
        let signature = identity.pq().sign(&cert_der).as_bytes().to_vec();
        let fingerprint = fingerprint(&cert_der);

        debug!(fp = %hex::encode(&fingerprint[..8]), "direct-path certificate generated");

        Ok(Self {
            cert_der,
            key_der: key_pair.serialize_der(),
            signature,
            fingerprint,
        })
    }
}

/// SHA-256 fingerprint of a DER-encoded certificate
#[must_use]
pub fn fingerprint(der: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(der);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Verify a peer's certificate binding and return its fingerprint to pin.
///
/// # Errors
///
/// [`DirectPathError::CertSignature`] when the signature does not verify
/// under the peer's long-term key.
pub fn verify_peer_cert(
    cert_der: &[u8],
    signature: &[u8],
    peer_pq: &PqVerifyingKey,
) -> Result<[u8; 32], DirectPathError> {
    let sig = PqSignature::from_slice(signature).map_err(|_| DirectPathError::CertSignature)?;
    peer_pq
        .verify(cert_der, &sig)
        .map_err(|_| DirectPathError::CertSignature)?;

    Ok(fingerprint(cert_der))
}

/// The pinned peer fingerprint, shared between the direct-path manager and
/// the TLS verifiers. Updated when PEER_INFO/ESTABLISHED deliver a new
/// certificate; consulted inside every direct TLS handshake.
#[derive(Clone, Debug, Default)]
pub struct PinStore {
    inner: Arc<Mutex<Option<[u8; 32]>>>,
}

impl PinStore {
    /// Create an empty store (all peers rejected until a pin is set)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pinned fingerprint
    pub fn pin(&self, fingerprint: [u8; 32]) {
        *self.inner.lock().expect("pin lock") = Some(fingerprint);
    }

    /// The current pin, if any
    #[must_use]
    pub fn current(&self) -> Option<[u8; 32]> {
        *self.inner.lock().expect("pin lock")
    }

    /// Whether `der` hashes to the pinned fingerprint (constant-time)
    #[must_use]
    pub fn matches(&self, der: &[u8]) -> bool {
        match self.current() {
            Some(pinned) => constant_time::verify_32(&fingerprint(der), &pinned),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_verify() {
        let identity = Identity::generate();
        let cert = DirectCert::generate(&identity).unwrap();

        let fp = verify_peer_cert(
            &cert.cert_der,
            &cert.signature,
            &identity.pq_verifying_key(),
        )
        .unwrap();

        assert_eq!(fp, cert.fingerprint);
    }

    #[test]
    fn test_wrong_identity_rejected() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let cert = DirectCert::generate(&identity).unwrap();

        assert!(matches!(
            verify_peer_cert(&cert.cert_der, &cert.signature, &other.pq_verifying_key()),
            Err(DirectPathError::CertSignature)
        ));
    }

    #[test]
    fn test_tampered_der_rejected() {
        let identity = Identity::generate();
        let cert = DirectCert::generate(&identity).unwrap();

        let mut der = cert.cert_der.clone();
        der[10] ^= 0x01;

        assert!(matches!(
            verify_peer_cert(&der, &cert.signature, &identity.pq_verifying_key()),
            Err(DirectPathError::CertSignature)
        ));
    }

    #[test]
    fn test_pin_store() {
        let identity = Identity::generate();
        let cert = DirectCert::generate(&identity).unwrap();

        let pins = PinStore::new();
        assert!(!pins.matches(&cert.cert_der));

        pins.pin(cert.fingerprint);
        assert!(pins.matches(&cert.cert_der));
        assert!(!pins.matches(b"some other certificate"));
    }

    #[test]
    fn test_fresh_certs_differ() {
        let identity = Identity::generate();
        let a = DirectCert::generate(&identity).unwrap();
        let b = DirectCert::generate(&identity).unwrap();

        assert_ne!(a.fingerprint, b.fingerprint);
    }
}
