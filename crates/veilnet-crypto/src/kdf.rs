//! Session key derivation.
//!
//! Both halves of the hybrid exchange feed HKDF-SHA-256: the ML-KEM shared
//! secret concatenated with the X25519 shared secret is the IKM, the session
//! id is the extract salt, and every output is expanded under a
//! direction-tagged label. The direction tags force distinct TX and RX keys;
//! the two roles read the same outputs with tx/rx swapped, which yields the
//! required `initiator.tx_key == responder.rx_key` symmetry.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::kem::KemSharedSecret;
use crate::ecdh::EcdhSharedSecret;
use crate::NONCE_SALT_SIZE;

const LABEL_KEY_I2R: &[u8] = b"veilnet v1 key i2r";
const LABEL_KEY_R2I: &[u8] = b"veilnet v1 key r2i";
const LABEL_PROOF: &[u8] = b"veilnet v1 proof";
const LABEL_SALT_I2R: &[u8] = b"veilnet v1 salt i2r";
const LABEL_SALT_R2I: &[u8] = b"veilnet v1 salt r2i";

/// Which side of the exchange this party played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Sent the public keys that were encapsulated against
    Initiator,
    /// Performed the encapsulation
    Responder,
}

/// Per-session symmetric material, zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeySet {
    /// AEAD key for frames this party sends
    pub tx_key: [u8; 32],
    /// AEAD key for frames this party receives
    pub rx_key: [u8; 32],
    /// HMAC key for the handshake proof value
    pub proof_key: [u8; 32],
    /// Nonce salt for the TX direction
    pub tx_salt: [u8; NONCE_SALT_SIZE],
    /// Nonce salt for the RX direction
    pub rx_salt: [u8; NONCE_SALT_SIZE],
}

/// Derive the session key set from the combined hybrid secrets.
///
/// The same call on both sides, with opposite `role` values, produces
/// mirror-image key sets.
#[must_use]
pub fn derive_session_keys(
    kem_secret: &KemSharedSecret,
    ecdh_secret: &EcdhSharedSecret,
    session_id: &[u8; 16],
    role: KeyRole,
) -> SessionKeySet {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(kem_secret.as_bytes());
    ikm[32..].copy_from_slice(ecdh_secret.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(session_id), &ikm);
    ikm.zeroize();

    let mut key_i2r = [0u8; 32];
    let mut key_r2i = [0u8; 32];
    let mut proof_key = [0u8; 32];
    let mut salt_i2r = [0u8; NONCE_SALT_SIZE];
    let mut salt_r2i = [0u8; NONCE_SALT_SIZE];

    // expand() only fails for oversize outputs; these are all <= 255 * 32.
    hk.expand(LABEL_KEY_I2R, &mut key_i2r).expect("hkdf expand");
    hk.expand(LABEL_KEY_R2I, &mut key_r2i).expect("hkdf expand");
    hk.expand(LABEL_PROOF, &mut proof_key).expect("hkdf expand");
    hk.expand(LABEL_SALT_I2R, &mut salt_i2r).expect("hkdf expand");
    hk.expand(LABEL_SALT_R2I, &mut salt_r2i).expect("hkdf expand");

    match role {
        KeyRole::Initiator => SessionKeySet {
            tx_key: key_i2r,
            rx_key: key_r2i,
            proof_key,
            tx_salt: salt_i2r,
            rx_salt: salt_r2i,
        },
        KeyRole::Responder => SessionKeySet {
            tx_key: key_r2i,
            rx_key: key_i2r,
            proof_key,
            tx_salt: salt_r2i,
            rx_salt: salt_i2r,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kem::{encapsulate, KemKeyPair};
    use crate::ecdh::EcdhSecretKey;
    use rand_core::OsRng;

    fn hybrid_secrets() -> (KemSharedSecret, KemSharedSecret, EcdhSharedSecret, EcdhSharedSecret)
    {
        let kem = KemKeyPair::generate();
        let (responder_kem, ct) = encapsulate(&kem.public_key()).unwrap();
        let initiator_kem = kem.decapsulate(&ct).unwrap();

        let alice = EcdhSecretKey::generate(&mut OsRng);
        let bob = EcdhSecretKey::generate(&mut OsRng);
        let alice_ss = alice.exchange(&bob.public_key()).unwrap();
        let bob_ss = bob.exchange(&alice.public_key()).unwrap();

        (initiator_kem, responder_kem, alice_ss, bob_ss)
    }

    #[test]
    fn test_key_symmetry() {
        let (i_kem, r_kem, i_ecdh, r_ecdh) = hybrid_secrets();
        let session_id = [0xABu8; 16];

        let initiator = derive_session_keys(&i_kem, &i_ecdh, &session_id, KeyRole::Initiator);
        let responder = derive_session_keys(&r_kem, &r_ecdh, &session_id, KeyRole::Responder);

        assert_eq!(initiator.tx_key, responder.rx_key);
        assert_eq!(initiator.rx_key, responder.tx_key);
        assert_eq!(initiator.proof_key, responder.proof_key);
        assert_eq!(initiator.tx_salt, responder.rx_salt);
        assert_eq!(initiator.rx_salt, responder.tx_salt);
    }

    #[test]
    fn test_directions_distinct() {
        let (i_kem, _, i_ecdh, _) = hybrid_secrets();
        let keys = derive_session_keys(&i_kem, &i_ecdh, &[1u8; 16], KeyRole::Initiator);

        assert_ne!(keys.tx_key, keys.rx_key);
        assert_ne!(keys.tx_salt, keys.rx_salt);
        assert_ne!(keys.tx_key, keys.proof_key);
    }

    #[test]
    fn test_session_id_separates_keys() {
        let (i_kem, _, i_ecdh, _) = hybrid_secrets();

        let a = derive_session_keys(&i_kem, &i_ecdh, &[1u8; 16], KeyRole::Initiator);
        let b = derive_session_keys(&i_kem, &i_ecdh, &[2u8; 16], KeyRole::Initiator);

        assert_ne!(a.tx_key, b.tx_key);
    }
}
