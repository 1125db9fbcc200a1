//! End-to-end pair key establishment.
//!
//! The relay never holds frame keys: it only publishes each client's
//! ephemeral HELLO keys to the counterpart. The second-joining client
//! encapsulates against the first joiner's ML-KEM key, runs a fresh X25519
//! exchange, and sends the result in a PEER_KEY message that the relay
//! forwards opaquely. Both sides then hold mirror-image key sets derived
//! from secrets only they know, and every DATA_FRAME is protected with
//! them.

use rand_core::OsRng;
use tracing::debug;
use veilnet_crypto::ecdh::{EcdhPublicKey, EcdhSecretKey};
use veilnet_crypto::kdf::derive_session_keys;
use veilnet_crypto::kem::{encapsulate, KemCiphertext, KemPublicKey};
use veilnet_crypto::pq_sign::{PqSignature, PqVerifyingKey};
use veilnet_crypto::sign::{EdSignature, EdVerifyingKey};
use veilnet_crypto::{CryptoError, KeyRole, SessionKeySet, PQ_SIGNATURE_SIZE};
use veilnet_proto::payload::PeerKey;

use crate::error::HandshakeError;
use crate::handshake::PairLocalKeys;
use crate::identity::Identity;
use crate::time::{unix_now_ns, within_skew};
use crate::SessionId;

/// Second-joiner side: build a PEER_KEY against the counterpart's ephemeral
/// HELLO keys and derive the pair key set.
///
/// The sender of PEER_KEY takes the responder role in the KDF (it performed
/// the encapsulation); the counterpart derives the mirror set with
/// [`accept_pair`].
///
/// # Errors
///
/// `Crypto` errors if the counterpart's advertised keys fail to parse.
pub fn initiate_pair(
    identity: &Identity,
    session_id: &SessionId,
    peer_kem_public: &[u8],
    peer_ecdh_public: &[u8],
) -> Result<(PeerKey, SessionKeySet), HandshakeError> {
    let peer_kem = KemPublicKey::from_slice(peer_kem_public)?;
    let peer_ecdh = ecdh_from_slice(peer_ecdh_public)?;

    let (kem_secret, kem_ciphertext) = encapsulate(&peer_kem)?;

    let ecdh = EcdhSecretKey::generate(&mut OsRng);
    let ecdh_public = ecdh.public_key().to_bytes();
    let ecdh_secret = ecdh.exchange(&peer_ecdh)?;

    let keys = derive_session_keys(&kem_secret, &ecdh_secret, session_id, KeyRole::Responder);

    let kem_ciphertext = *kem_ciphertext.as_bytes();
    let timestamp_ns = unix_now_ns();
    let tuple = PeerKey::signed_tuple(session_id, &kem_ciphertext, &ecdh_public, timestamp_ns);

    let mut pq_signature = [0u8; PQ_SIGNATURE_SIZE];
    pq_signature.copy_from_slice(identity.pq().sign(&tuple).as_bytes());

    debug!(session = %hex::encode(session_id), "pair keys initiated");

    Ok((
        PeerKey {
            session_id: *session_id,
            kem_ciphertext,
            ecdh_public,
            timestamp_ns,
            pq_signature,
            ed_signature: *identity.ed().sign(&tuple).as_bytes(),
        },
        keys,
    ))
}

/// First-joiner side: verify a received PEER_KEY and derive the pair key
/// set with the ephemeral keys kept from our own HELLO.
///
/// # Errors
///
/// `SessionMismatch`, `ReplayAttack` (timestamp skew), `InvalidSignature`,
/// or `Crypto` errors on malformed key material.
pub fn accept_pair(
    peer_key: &PeerKey,
    local: &PairLocalKeys,
    peer_pq: &PqVerifyingKey,
    peer_ed: &EdVerifyingKey,
    session_id: &SessionId,
    now_ns: u64,
) -> Result<SessionKeySet, HandshakeError> {
    if peer_key.session_id != *session_id {
        return Err(HandshakeError::SessionMismatch);
    }

    if !within_skew(peer_key.timestamp_ns, now_ns) {
        return Err(HandshakeError::ReplayAttack);
    }

    let tuple = PeerKey::signed_tuple(
        &peer_key.session_id,
        &peer_key.kem_ciphertext,
        &peer_key.ecdh_public,
        peer_key.timestamp_ns,
    );

    let pq_sig = PqSignature::from_slice(&peer_key.pq_signature)?;
    peer_pq
        .verify(&tuple, &pq_sig)
        .map_err(|_| HandshakeError::InvalidSignature)?;
    peer_ed
        .verify(&tuple, &EdSignature::from_bytes(peer_key.ed_signature))
        .map_err(|_| HandshakeError::InvalidSignature)?;

    let kem_secret = local
        .kem
        .decapsulate(&KemCiphertext::from_slice(&peer_key.kem_ciphertext)?)?;
    let ecdh_secret = local
        .ecdh
        .exchange(&EcdhPublicKey::from_bytes(peer_key.ecdh_public))?;

    debug!(session = %hex::encode(session_id), "pair keys accepted");

    Ok(derive_session_keys(
        &kem_secret,
        &ecdh_secret,
        session_id,
        KeyRole::Initiator,
    ))
}

fn ecdh_from_slice(slice: &[u8]) -> Result<EcdhPublicKey, CryptoError> {
    if slice.len() != 32 {
        return Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: slice.len(),
        });
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(slice);
    Ok(EcdhPublicKey::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use veilnet_crypto::kem::KemKeyPair;

    struct Party {
        identity: Arc<Identity>,
        local: PairLocalKeys,
    }

    fn party() -> Party {
        Party {
            identity: Arc::new(Identity::generate()),
            local: PairLocalKeys {
                kem: KemKeyPair::generate(),
                ecdh: EcdhSecretKey::generate(&mut OsRng),
            },
        }
    }

    #[test]
    fn test_pair_establishment_mirror_keys() {
        let first = party();
        let second = party();
        let session_id = [0x44u8; 16];

        // Second joiner learns the first joiner's HELLO keys via the relay
        let (peer_key, second_keys) = initiate_pair(
            &second.identity,
            &session_id,
            first.local.kem.public_key().as_bytes(),
            &first.local.ecdh.public_key().to_bytes(),
        )
        .unwrap();

        let first_keys = accept_pair(
            &peer_key,
            &first.local,
            &second.identity.pq_verifying_key(),
            &second.identity.ed_verifying_key(),
            &session_id,
            unix_now_ns(),
        )
        .unwrap();

        assert_eq!(first_keys.tx_key, second_keys.rx_key);
        assert_eq!(first_keys.rx_key, second_keys.tx_key);
        assert_eq!(first_keys.tx_salt, second_keys.rx_salt);
        assert_eq!(first_keys.rx_salt, second_keys.tx_salt);
    }

    #[test]
    fn test_wrong_session_rejected() {
        let first = party();
        let second = party();

        let (peer_key, _) = initiate_pair(
            &second.identity,
            &[1u8; 16],
            first.local.kem.public_key().as_bytes(),
            &first.local.ecdh.public_key().to_bytes(),
        )
        .unwrap();

        assert!(matches!(
            accept_pair(
                &peer_key,
                &first.local,
                &second.identity.pq_verifying_key(),
                &second.identity.ed_verifying_key(),
                &[2u8; 16],
                unix_now_ns(),
            ),
            Err(HandshakeError::SessionMismatch)
        ));
    }

    #[test]
    fn test_tampered_peer_key_rejected() {
        let first = party();
        let second = party();
        let session_id = [3u8; 16];

        let (mut peer_key, _) = initiate_pair(
            &second.identity,
            &session_id,
            first.local.kem.public_key().as_bytes(),
            &first.local.ecdh.public_key().to_bytes(),
        )
        .unwrap();
        peer_key.ecdh_public[0] ^= 0xFF;

        assert!(matches!(
            accept_pair(
                &peer_key,
                &first.local,
                &second.identity.pq_verifying_key(),
                &second.identity.ed_verifying_key(),
                &session_id,
                unix_now_ns(),
            ),
            Err(HandshakeError::InvalidSignature)
        ));
    }

    #[test]
    fn test_stale_peer_key_rejected() {
        let first = party();
        let second = party();
        let session_id = [4u8; 16];

        let (peer_key, _) = initiate_pair(
            &second.identity,
            &session_id,
            first.local.kem.public_key().as_bytes(),
            &first.local.ecdh.public_key().to_bytes(),
        )
        .unwrap();

        let skewed = peer_key.timestamp_ns + crate::time::MAX_CLOCK_SKEW_NS + 1_000_000;
        assert!(matches!(
            accept_pair(
                &peer_key,
                &first.local,
                &second.identity.pq_verifying_key(),
                &second.identity.ed_verifying_key(),
                &session_id,
                skewed,
            ),
            Err(HandshakeError::ReplayAttack)
        ));
    }

    #[test]
    fn test_signature_from_impostor_rejected() {
        let first = party();
        let second = party();
        let impostor = party();
        let session_id = [5u8; 16];

        let (peer_key, _) = initiate_pair(
            &second.identity,
            &session_id,
            first.local.kem.public_key().as_bytes(),
            &first.local.ecdh.public_key().to_bytes(),
        )
        .unwrap();

        // Verifying against the impostor's keys must fail
        assert!(matches!(
            accept_pair(
                &peer_key,
                &first.local,
                &impostor.identity.pq_verifying_key(),
                &impostor.identity.ed_verifying_key(),
                &session_id,
                unix_now_ns(),
            ),
            Err(HandshakeError::InvalidSignature)
        ));
    }
}
