//! The four-message hybrid handshake.
//!
//! HELLO/CHALLENGE/RESPONSE/ESTABLISHED between an initiator and a
//! responder. The relay runs the responder side with each client
//! independently; in the listener/connector modes the two endpoints run it
//! directly against each other over the direct TLS channel.
//!
//! The state machines here are transport-free: messages in, messages out.
//! The caller owns the socket, the 30-second overall deadline, and the
//! decision of which session id the responder mints. A HELLO carrying the
//! `KEY_ROTATION` header flag re-enters the same machine for an
//! intra-session rekey.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use veilnet_crypto::ecdh::{EcdhPublicKey, EcdhSecretKey};
use veilnet_crypto::kdf::derive_session_keys;
use veilnet_crypto::kem::{encapsulate, KemCiphertext, KemKeyPair, KemPublicKey};
use veilnet_crypto::mac::{hmac_sha256, verify_proof};
use veilnet_crypto::pq_sign::{PqSignature, PqVerifyingKey};
use veilnet_crypto::sign::{EdSignature, EdVerifyingKey};
use veilnet_crypto::{KeyRole, SessionKeySet, KEM_PUBLIC_KEY_SIZE, PQ_PUBLIC_KEY_SIZE, PQ_SIGNATURE_SIZE};
use veilnet_proto::payload::{Challenge, Established, Hello, PeerBlock, Response};
use veilnet_proto::Capabilities;

use crate::error::HandshakeError;
use crate::identity::Identity;
use crate::time::{unix_now_ns, within_skew};
use crate::{EndpointId, SessionId};

/// Overall deadline for the four-message exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the client advertises in RESPONSE
#[derive(Debug, Clone, Default)]
pub struct ClientAnnounce {
    /// Capability bits
    pub capabilities: Capabilities,
    /// Direct-path listener port, 0 when direct paths are disabled
    pub direct_port: u16,
    /// Direct-path certificate DER
    pub certificate: Vec<u8>,
    /// Long-term PQ signature over the certificate DER
    pub certificate_sig: Vec<u8>,
}

/// Parameters the responder hands out in ESTABLISHED
#[derive(Debug, Clone)]
pub struct ServerParams {
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Virtual-device MTU
    pub mtu: u16,
    /// Key rotation interval
    pub key_rotation_interval: Duration,
    /// Responder capability bits
    pub capabilities: Capabilities,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            mtu: 1500,
            key_rotation_interval: Duration::from_secs(3600),
            capabilities: Capabilities::none(),
        }
    }
}

/// Parameters negotiated in ESTABLISHED, as seen by the initiator
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Virtual-device MTU
    pub mtu: u16,
    /// Key rotation interval
    pub key_rotation_interval: Duration,
    /// Responder capability bits
    pub capabilities: Capabilities,
}

/// The ephemeral key material from our own HELLO, kept alive so the
/// counterpart's PEER_KEY can be decapsulated later.
pub struct PairLocalKeys {
    /// The HELLO ML-KEM keypair
    pub kem: KemKeyPair,
    /// The HELLO X25519 secret
    pub ecdh: EcdhSecretKey,
}

/// Successful initiator handshake
pub struct ClientOutcome {
    /// Session id minted by the responder
    pub session_id: SessionId,
    /// Keys shared with the responder (control keys in relay mode)
    pub keys: SessionKeySet,
    /// Negotiated parameters
    pub params: NegotiatedParams,
    /// Counterpart metadata (empty until the peer joins)
    pub peer: PeerBlock,
    /// The responder's endpoint id
    pub responder_id: EndpointId,
    /// Ephemeral keys for later pair establishment
    pub local_eph: PairLocalKeys,
}

/// The identity material a HELLO presented, retained by the responder
#[derive(Debug, Clone)]
pub struct HelloRecord {
    /// Client endpoint id
    pub client_id: EndpointId,
    /// Ephemeral ML-KEM public key
    pub kem_public: [u8; KEM_PUBLIC_KEY_SIZE],
    /// Ephemeral X25519 public key
    pub ecdh_public: [u8; 32],
    /// Long-term ML-DSA-87 verify key bytes
    pub pq_public: [u8; PQ_PUBLIC_KEY_SIZE],
    /// Long-term Ed25519 verify key bytes
    pub ed_public: [u8; 32],
}

/// Successful responder handshake
pub struct ServerOutcome {
    /// Session id this exchange was bound to
    pub session_id: SessionId,
    /// Keys shared with the initiator
    pub keys: SessionKeySet,
    /// The initiator's presented identity and ephemeral keys
    pub client: HelloRecord,
    /// Client capability bits
    pub capabilities: Capabilities,
    /// Client direct-path listener port
    pub direct_port: u16,
    /// Client direct-path certificate DER
    pub certificate: Vec<u8>,
    /// Client PQ signature over the certificate DER
    pub certificate_sig: Vec<u8>,
}

enum ClientState {
    Ready,
    AwaitChallenge,
    AwaitEstablished {
        session_id: SessionId,
        keys: SessionKeySet,
        responder_id: EndpointId,
    },
    Complete,
}

/// Initiator side of the handshake
pub struct ClientHandshake {
    identity: Arc<Identity>,
    announce: ClientAnnounce,
    kem: Option<KemKeyPair>,
    ecdh: Option<EcdhSecretKey>,
    state: ClientState,
}

impl ClientHandshake {
    /// Create an initiator with fresh ephemeral keys
    #[must_use]
    pub fn new(identity: Arc<Identity>, announce: ClientAnnounce) -> Self {
        Self {
            identity,
            announce,
            kem: Some(KemKeyPair::generate()),
            ecdh: Some(EcdhSecretKey::generate(&mut OsRng)),
            state: ClientState::Ready,
        }
    }

    /// Build the HELLO message. The caller chooses the header flags
    /// (`KEY_ROTATION` for an intra-session rekey) at encode time.
    ///
    /// # Errors
    ///
    /// `UnexpectedMessage` if called twice.
    pub fn hello(&mut self) -> Result<Hello, HandshakeError> {
        if !matches!(self.state, ClientState::Ready) {
            return Err(HandshakeError::UnexpectedMessage("hello already sent"));
        }

        let kem_public = *self
            .kem
            .as_ref()
            .expect("ephemeral keys live until outcome")
            .public_key()
            .as_bytes();
        let ecdh_public = self
            .ecdh
            .as_ref()
            .expect("ephemeral keys live until outcome")
            .public_key()
            .to_bytes();

        let client_id = self.identity.endpoint_id();
        let timestamp_ns = unix_now_ns();

        let tuple = Hello::signed_tuple(&client_id, &kem_public, &ecdh_public, timestamp_ns);
        let pq_signature = sig_to_array(&self.identity.pq().sign(&tuple));
        let ed_signature = *self.identity.ed().sign(&tuple).as_bytes();

        let mut pq_public = [0u8; PQ_PUBLIC_KEY_SIZE];
        pq_public.copy_from_slice(self.identity.pq_verifying_key().as_bytes());

        self.state = ClientState::AwaitChallenge;

        Ok(Hello {
            client_id,
            kem_public,
            ecdh_public,
            pq_signature,
            ed_signature,
            timestamp_ns,
            pq_public,
            ed_public: self.identity.ed_verifying_key().to_bytes(),
        })
    }

    /// Process CHALLENGE, deriving the session keys and producing RESPONSE.
    ///
    /// # Errors
    ///
    /// `IdentityMismatch` when the relay id does not hash from the presented
    /// key, `InvalidSignature` when either signature fails, `ReplayAttack`
    /// on timestamp skew beyond 30 s, `UnexpectedMessage` out of order.
    pub fn handle_challenge(
        &mut self,
        challenge: &Challenge,
        now_ns: u64,
    ) -> Result<Response, HandshakeError> {
        if !matches!(self.state, ClientState::AwaitChallenge) {
            return Err(HandshakeError::UnexpectedMessage("challenge out of order"));
        }

        let responder_pq = PqVerifyingKey::from_slice(&challenge.pq_public)?;
        if responder_pq.endpoint_id() != challenge.relay_id {
            return Err(HandshakeError::IdentityMismatch);
        }

        if !within_skew(challenge.timestamp_ns, now_ns) {
            return Err(HandshakeError::ReplayAttack);
        }

        let tuple = Challenge::signed_tuple(
            &challenge.relay_id,
            &challenge.session_id,
            &challenge.kem_ciphertext,
            &challenge.ecdh_public,
            &challenge.nonce,
            challenge.timestamp_ns,
        );

        let pq_sig = PqSignature::from_slice(&challenge.pq_signature)?;
        responder_pq
            .verify(&tuple, &pq_sig)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        let responder_ed = EdVerifyingKey::from_bytes(&challenge.ed_public)?;
        responder_ed
            .verify(&tuple, &EdSignature::from_bytes(challenge.ed_signature))
            .map_err(|_| HandshakeError::InvalidSignature)?;

        let kem = self.kem.as_ref().expect("ephemeral keys live until outcome");
        let kem_secret = kem.decapsulate(&KemCiphertext::from_slice(&challenge.kem_ciphertext)?)?;

        let ecdh = self
            .ecdh
            .as_ref()
            .expect("ephemeral keys live until outcome");
        let ecdh_secret = ecdh.exchange(&EcdhPublicKey::from_bytes(challenge.ecdh_public))?;

        let keys = derive_session_keys(
            &kem_secret,
            &ecdh_secret,
            &challenge.session_id,
            KeyRole::Initiator,
        );

        let proof = hmac_sha256(&keys.proof_key, &challenge.nonce);

        self.state = ClientState::AwaitEstablished {
            session_id: challenge.session_id,
            keys,
            responder_id: challenge.relay_id,
        };

        Ok(Response {
            session_id: challenge.session_id,
            proof,
            capabilities: self.announce.capabilities.0,
            direct_port: self.announce.direct_port,
            certificate: self.announce.certificate.clone(),
            certificate_sig: self.announce.certificate_sig.clone(),
        })
    }

    /// Process ESTABLISHED and finish the handshake.
    ///
    /// # Errors
    ///
    /// `SessionMismatch` if the session id changed; `UnexpectedMessage` out
    /// of order.
    pub fn handle_established(
        &mut self,
        established: &Established,
    ) -> Result<ClientOutcome, HandshakeError> {
        let state = mem::replace(&mut self.state, ClientState::Complete);
        let ClientState::AwaitEstablished {
            session_id,
            keys,
            responder_id,
        } = state
        else {
            self.state = state;
            return Err(HandshakeError::UnexpectedMessage("established out of order"));
        };

        if established.session_id != session_id {
            return Err(HandshakeError::SessionMismatch);
        }

        Ok(ClientOutcome {
            session_id,
            keys,
            params: NegotiatedParams {
                heartbeat_interval: Duration::from_secs(u64::from(
                    established.heartbeat_interval_secs,
                )),
                mtu: established.mtu,
                key_rotation_interval: Duration::from_secs(u64::from(
                    established.key_rotation_interval_secs,
                )),
                capabilities: Capabilities(established.capabilities),
            },
            peer: established.peer.clone(),
            responder_id,
            local_eph: PairLocalKeys {
                kem: self.kem.take().expect("ephemeral keys live until outcome"),
                ecdh: self.ecdh.take().expect("ephemeral keys live until outcome"),
            },
        })
    }
}

enum ServerState {
    AwaitHello,
    AwaitResponse {
        session_id: SessionId,
        keys: SessionKeySet,
        nonce: [u8; 24],
        client: HelloRecord,
    },
    Complete,
}

/// Responder side of the handshake (relay, or the direct-path listener)
pub struct ServerHandshake {
    identity: Arc<Identity>,
    state: ServerState,
}

impl ServerHandshake {
    /// Create a responder
    #[must_use]
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            state: ServerState::AwaitHello,
        }
    }

    /// Process HELLO and produce CHALLENGE bound to `session_id`.
    ///
    /// The caller mints the session id: the relay uses one id per client
    /// pair, the direct-path listener a fresh random one.
    ///
    /// # Errors
    ///
    /// `IdentityMismatch`, `InvalidSignature`, `ReplayAttack` per the
    /// validation rules; `UnexpectedMessage` out of order.
    pub fn handle_hello(
        &mut self,
        hello: &Hello,
        session_id: SessionId,
        now_ns: u64,
    ) -> Result<Challenge, HandshakeError> {
        if !matches!(self.state, ServerState::AwaitHello) {
            return Err(HandshakeError::UnexpectedMessage("hello out of order"));
        }

        let client_pq = PqVerifyingKey::from_slice(&hello.pq_public)?;
        if client_pq.endpoint_id() != hello.client_id {
            return Err(HandshakeError::IdentityMismatch);
        }

        if !within_skew(hello.timestamp_ns, now_ns) {
            return Err(HandshakeError::ReplayAttack);
        }

        let tuple = Hello::signed_tuple(
            &hello.client_id,
            &hello.kem_public,
            &hello.ecdh_public,
            hello.timestamp_ns,
        );

        let pq_sig = PqSignature::from_slice(&hello.pq_signature)?;
        client_pq
            .verify(&tuple, &pq_sig)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        let client_ed = EdVerifyingKey::from_bytes(&hello.ed_public)?;
        client_ed
            .verify(&tuple, &EdSignature::from_bytes(hello.ed_signature))
            .map_err(|_| HandshakeError::InvalidSignature)?;

        let (kem_secret, kem_ciphertext) =
            encapsulate(&KemPublicKey::from_slice(&hello.kem_public)?)?;

        let ecdh = EcdhSecretKey::generate(&mut OsRng);
        let ecdh_public = ecdh.public_key().to_bytes();
        let ecdh_secret = ecdh.exchange(&EcdhPublicKey::from_bytes(hello.ecdh_public))?;

        let keys =
            derive_session_keys(&kem_secret, &ecdh_secret, &session_id, KeyRole::Responder);

        let nonce = veilnet_crypto::random::random_24()?;
        let relay_id = self.identity.endpoint_id();
        let timestamp_ns = unix_now_ns();

        let kem_ciphertext = *kem_ciphertext.as_bytes();
        let signed = Challenge::signed_tuple(
            &relay_id,
            &session_id,
            &kem_ciphertext,
            &ecdh_public,
            &nonce,
            timestamp_ns,
        );
        let pq_signature = sig_to_array(&self.identity.pq().sign(&signed));
        let ed_signature = *self.identity.ed().sign(&signed).as_bytes();

        let mut pq_public = [0u8; PQ_PUBLIC_KEY_SIZE];
        pq_public.copy_from_slice(self.identity.pq_verifying_key().as_bytes());

        self.state = ServerState::AwaitResponse {
            session_id,
            keys,
            nonce,
            client: HelloRecord {
                client_id: hello.client_id,
                kem_public: hello.kem_public,
                ecdh_public: hello.ecdh_public,
                pq_public: hello.pq_public,
                ed_public: hello.ed_public,
            },
        };

        Ok(Challenge {
            relay_id,
            session_id,
            kem_ciphertext,
            ecdh_public,
            nonce,
            pq_signature,
            ed_signature,
            timestamp_ns,
            pq_public,
            ed_public: self.identity.ed_verifying_key().to_bytes(),
        })
    }

    /// Verify RESPONSE and finish the responder handshake.
    ///
    /// The caller builds and sends ESTABLISHED from the outcome; the peer
    /// metadata lives outside the state machine.
    ///
    /// # Errors
    ///
    /// `InvalidSignature` on proof mismatch (constant-time comparison);
    /// `SessionMismatch` if the response references another session;
    /// `UnexpectedMessage` out of order.
    pub fn handle_response(&mut self, response: &Response) -> Result<ServerOutcome, HandshakeError> {
        let state = mem::replace(&mut self.state, ServerState::Complete);
        let ServerState::AwaitResponse {
            session_id,
            keys,
            nonce,
            client,
        } = state
        else {
            self.state = state;
            return Err(HandshakeError::UnexpectedMessage("response out of order"));
        };

        if response.session_id != session_id {
            return Err(HandshakeError::SessionMismatch);
        }

        if !verify_proof(&keys.proof_key, &nonce, &response.proof) {
            return Err(HandshakeError::InvalidSignature);
        }

        Ok(ServerOutcome {
            session_id,
            keys,
            client,
            capabilities: Capabilities(response.capabilities),
            direct_port: response.direct_port,
            certificate: response.certificate.clone(),
            certificate_sig: response.certificate_sig.clone(),
        })
    }
}

/// Build the ESTABLISHED message from responder state
#[must_use]
pub fn build_established(
    session_id: SessionId,
    params: &ServerParams,
    peer: PeerBlock,
) -> Established {
    Established {
        session_id,
        capabilities: params.capabilities.0,
        heartbeat_interval_secs: params.heartbeat_interval.as_secs() as u32,
        mtu: params.mtu,
        key_rotation_interval_secs: params.key_rotation_interval.as_secs() as u32,
        peer,
    }
}

fn sig_to_array(sig: &PqSignature) -> [u8; PQ_SIGNATURE_SIZE] {
    let mut out = [0u8; PQ_SIGNATURE_SIZE];
    out.copy_from_slice(sig.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MAX_CLOCK_SKEW_NS;

    fn run_exchange() -> (ClientOutcome, ServerOutcome) {
        let client_identity = Arc::new(Identity::generate());
        let server_identity = Arc::new(Identity::generate());

        let mut client = ClientHandshake::new(
            client_identity,
            ClientAnnounce {
                capabilities: Capabilities::none().with(Capabilities::DIRECT_P2P),
                direct_port: 40123,
                certificate: vec![0xAB; 100],
                certificate_sig: vec![0xCD; 100],
            },
        );
        let mut server = ServerHandshake::new(server_identity);

        let now = unix_now_ns();
        let session_id = [7u8; 16];

        let hello = client.hello().unwrap();
        let challenge = server.handle_hello(&hello, session_id, now).unwrap();
        let response = client.handle_challenge(&challenge, now).unwrap();
        let server_outcome = server.handle_response(&response).unwrap();

        let established = build_established(
            session_id,
            &ServerParams::default(),
            PeerBlock::default(),
        );
        let client_outcome = client.handle_established(&established).unwrap();

        (client_outcome, server_outcome)
    }

    #[test]
    fn test_full_exchange_key_symmetry() {
        let (client, server) = run_exchange();

        assert_eq!(client.session_id, server.session_id);
        assert_eq!(client.keys.tx_key, server.keys.rx_key);
        assert_eq!(client.keys.rx_key, server.keys.tx_key);
        assert_eq!(client.keys.tx_salt, server.keys.rx_salt);
        assert_eq!(client.keys.rx_salt, server.keys.tx_salt);
    }

    #[test]
    fn test_announce_reaches_responder() {
        let (_, server) = run_exchange();

        assert!(server.capabilities.has(Capabilities::DIRECT_P2P));
        assert_eq!(server.direct_port, 40123);
        assert_eq!(server.certificate.len(), 100);
    }

    #[test]
    fn test_negotiated_params() {
        let (client, _) = run_exchange();

        assert_eq!(client.params.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(client.params.mtu, 1500);
    }

    #[test]
    fn test_stale_hello_rejected() {
        let client_identity = Arc::new(Identity::generate());
        let server_identity = Arc::new(Identity::generate());

        let mut client = ClientHandshake::new(client_identity, ClientAnnounce::default());
        let mut server = ServerHandshake::new(server_identity);

        let hello = client.hello().unwrap();
        let skewed_now = hello.timestamp_ns + MAX_CLOCK_SKEW_NS + 1_000_000;

        assert!(matches!(
            server.handle_hello(&hello, [1u8; 16], skewed_now),
            Err(HandshakeError::ReplayAttack)
        ));
    }

    #[test]
    fn test_tampered_hello_signature_rejected() {
        let client_identity = Arc::new(Identity::generate());
        let server_identity = Arc::new(Identity::generate());

        let mut client = ClientHandshake::new(client_identity, ClientAnnounce::default());
        let mut server = ServerHandshake::new(server_identity);

        let mut hello = client.hello().unwrap();
        hello.ecdh_public[0] ^= 0xFF;

        assert!(matches!(
            server.handle_hello(&hello, [1u8; 16], unix_now_ns()),
            Err(HandshakeError::InvalidSignature)
        ));
    }

    #[test]
    fn test_forged_client_id_rejected() {
        let client_identity = Arc::new(Identity::generate());
        let server_identity = Arc::new(Identity::generate());

        let mut client = ClientHandshake::new(client_identity, ClientAnnounce::default());
        let mut server = ServerHandshake::new(server_identity);

        let mut hello = client.hello().unwrap();
        hello.client_id = [0x99u8; 32];

        assert!(matches!(
            server.handle_hello(&hello, [1u8; 16], unix_now_ns()),
            Err(HandshakeError::IdentityMismatch)
        ));
    }

    #[test]
    fn test_bad_proof_rejected() {
        let client_identity = Arc::new(Identity::generate());
        let server_identity = Arc::new(Identity::generate());

        let mut client = ClientHandshake::new(client_identity, ClientAnnounce::default());
        let mut server = ServerHandshake::new(server_identity);

        let now = unix_now_ns();
        let hello = client.hello().unwrap();
        let challenge = server.handle_hello(&hello, [2u8; 16], now).unwrap();
        let mut response = client.handle_challenge(&challenge, now).unwrap();
        response.proof[0] ^= 0x01;

        assert!(matches!(
            server.handle_response(&response),
            Err(HandshakeError::InvalidSignature)
        ));
    }

    #[test]
    fn test_session_mismatch_in_established() {
        let client_identity = Arc::new(Identity::generate());
        let server_identity = Arc::new(Identity::generate());

        let mut client = ClientHandshake::new(client_identity, ClientAnnounce::default());
        let mut server = ServerHandshake::new(server_identity);

        let now = unix_now_ns();
        let hello = client.hello().unwrap();
        let challenge = server.handle_hello(&hello, [3u8; 16], now).unwrap();
        let _ = client.handle_challenge(&challenge, now).unwrap();

        let established = build_established(
            [9u8; 16],
            &ServerParams::default(),
            PeerBlock::default(),
        );

        assert!(matches!(
            client.handle_established(&established),
            Err(HandshakeError::SessionMismatch)
        ));
    }

    #[test]
    fn test_out_of_order_messages_rejected() {
        let client_identity = Arc::new(Identity::generate());
        let mut client = ClientHandshake::new(client_identity.clone(), ClientAnnounce::default());

        let established = build_established(
            [1u8; 16],
            &ServerParams::default(),
            PeerBlock::default(),
        );
        assert!(matches!(
            client.handle_established(&established),
            Err(HandshakeError::UnexpectedMessage(_))
        ));

        let _ = client.hello().unwrap();
        assert!(matches!(
            client.hello(),
            Err(HandshakeError::UnexpectedMessage(_))
        ));
    }
}
