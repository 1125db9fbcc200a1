//! HMAC-SHA-256 handshake proofs.
//!
//! RESPONSE proves possession of the derived proof key by MACing the
//! responder's nonce; the direct-path re-handshake proves possession of the
//! session keys by MACing fresh challenges with the sender's TX key.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::constant_time;

type HmacSha256 = Hmac<Sha256>;

/// Compute `HMAC-SHA-256(key, data)`
#[must_use]
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);

    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Verify a proof value in constant time
#[must_use]
pub fn verify_proof(key: &[u8; 32], data: &[u8], proof: &[u8; 32]) -> bool {
    let expected = hmac_sha256(key, data);
    constant_time::verify_32(&expected, proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_roundtrip() {
        let key = [0x55u8; 32];
        let proof = hmac_sha256(&key, b"challenge bytes");

        assert!(verify_proof(&key, b"challenge bytes", &proof));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let proof = hmac_sha256(&[0x55u8; 32], b"challenge");
        assert!(!verify_proof(&[0x56u8; 32], b"challenge", &proof));
    }

    #[test]
    fn test_wrong_data_rejected() {
        let key = [0x55u8; 32];
        let proof = hmac_sha256(&key, b"challenge");
        assert!(!verify_proof(&key, b"other", &proof));
    }
}
