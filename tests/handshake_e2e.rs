//! End-to-end handshake scenarios driven through the wire codec.

use veilnet_core::cert::{verify_peer_cert, DirectCert};
use veilnet_core::handshake::{
    build_established, ClientAnnounce, ClientHandshake, ServerHandshake, ServerParams,
};
use veilnet_core::pair::{accept_pair, initiate_pair};
use veilnet_core::time::unix_now_ns;
use veilnet_crypto::mac::hmac_sha256;
use veilnet_integration_tests::{identity, through_wire, through_wire_with_flags};
use veilnet_proto::payload::PeerBlock;
use veilnet_proto::{Capabilities, Message, MessageFlags};

/// Relay handshake success: after the four messages both parties agree on
/// session id, mirrored keys, and negotiated parameters.
#[test]
fn relay_handshake_success() {
    let client_identity = identity();
    let relay_identity = identity();

    let mut client = ClientHandshake::new(
        client_identity.clone(),
        ClientAnnounce {
            capabilities: Capabilities::none().with(Capabilities::DIRECT_P2P),
            direct_port: 45001,
            ..ClientAnnounce::default()
        },
    );
    let mut relay = ServerHandshake::new(relay_identity.clone());

    let session_id = [0xA1u8; 16];
    let now = unix_now_ns();

    // HELLO crosses the wire
    let hello = client.hello().unwrap();
    let Message::Hello(hello) = through_wire(&Message::Hello(hello)) else {
        panic!("codec changed the message type");
    };
    assert_eq!(hello.client_id, client_identity.endpoint_id());

    // CHALLENGE crosses back
    let challenge = relay.handle_hello(&hello, session_id, now).unwrap();
    let Message::Challenge(challenge) = through_wire(&Message::Challenge(Box::new(challenge)))
    else {
        panic!("codec changed the message type");
    };

    // RESPONSE with the HMAC proof
    let response = client.handle_challenge(&challenge, now).unwrap();
    let Message::Response(response) = through_wire(&Message::Response(response)) else {
        panic!("codec changed the message type");
    };
    let server_outcome = relay.handle_response(&response).unwrap();

    // ESTABLISHED completes the client side
    let established = build_established(session_id, &ServerParams::default(), PeerBlock::default());
    let Message::Established(established) = through_wire(&Message::Established(established)) else {
        panic!("codec changed the message type");
    };
    let client_outcome = client.handle_established(&established).unwrap();

    assert_eq!(client_outcome.session_id, server_outcome.session_id);
    assert_eq!(client_outcome.keys.tx_key, server_outcome.keys.rx_key);
    assert_eq!(client_outcome.keys.rx_key, server_outcome.keys.tx_key);
    assert_eq!(
        client_outcome.params.heartbeat_interval.as_secs(),
        30,
        "default heartbeat interval"
    );
    assert_eq!(client_outcome.params.mtu, 1500);
    assert!(server_outcome.capabilities.has(Capabilities::DIRECT_P2P));
    assert_eq!(server_outcome.direct_port, 45001);
}

/// The KEY_ROTATION flag survives the wire and marks a rekey HELLO.
#[test]
fn key_rotation_flag_roundtrip() {
    let mut client = ClientHandshake::new(identity(), ClientAnnounce::default());
    let hello = client.hello().unwrap();

    let flags = MessageFlags::none().with(MessageFlags::KEY_ROTATION);
    let (_, decoded_flags) = through_wire_with_flags(&Message::Hello(hello), flags);

    assert!(decoded_flags.has(MessageFlags::KEY_ROTATION));
}

/// Pair establishment through the relay: the second joiner encapsulates
/// against the first joiner's HELLO keys; both end with mirrored key sets
/// without the relay ever holding them.
#[test]
fn pair_establishment_through_relay() {
    let first_identity = identity();
    let second_identity = identity();
    let relay_identity = identity();
    let session_id = [0x42u8; 16];
    let now = unix_now_ns();

    // First joiner handshakes with the relay; its ephemeral keys end up in
    // the relay's records.
    let mut first = ClientHandshake::new(first_identity.clone(), ClientAnnounce::default());
    let mut relay_side_a = ServerHandshake::new(relay_identity.clone());
    let hello_a = first.hello().unwrap();
    let challenge_a = relay_side_a.handle_hello(&hello_a, session_id, now).unwrap();
    let response_a = first.handle_challenge(&challenge_a, now).unwrap();
    let record_a = relay_side_a.handle_response(&response_a).unwrap();
    let established_a =
        build_established(session_id, &ServerParams::default(), PeerBlock::default());
    let first_outcome = first.handle_established(&established_a).unwrap();

    // Second joiner receives the first joiner's advertised keys and builds
    // the PEER_KEY the relay forwards opaquely.
    let (peer_key, second_keys) = initiate_pair(
        &second_identity,
        &session_id,
        &record_a.client.kem_public,
        &record_a.client.ecdh_public,
    )
    .unwrap();

    let Message::PeerKey(peer_key) = through_wire(&Message::PeerKey(Box::new(peer_key))) else {
        panic!("codec changed the message type");
    };

    let first_keys = accept_pair(
        &peer_key,
        &first_outcome.local_eph,
        &second_identity.pq_verifying_key(),
        &second_identity.ed_verifying_key(),
        &session_id,
        unix_now_ns(),
    )
    .unwrap();

    assert_eq!(first_keys.tx_key, second_keys.rx_key);
    assert_eq!(first_keys.rx_key, second_keys.tx_key);
    assert_eq!(first_keys.tx_salt, second_keys.rx_salt);

    // The re-handshake proof chain holds: a proof made with one side's TX
    // key verifies under the other side's RX key.
    let challenge = [0x77u8; 32];
    let proof = hmac_sha256(&first_keys.tx_key, &challenge);
    assert_eq!(proof, hmac_sha256(&second_keys.rx_key, &challenge));
}

/// Direct-path certificates verify under the long-term key learned through
/// the relay, and only under that key.
#[test]
fn certificate_chain_through_relay() {
    let endpoint_identity = identity();
    let cert = DirectCert::generate(&endpoint_identity).unwrap();

    // The counterpart learns the long-term key from the relay's signed
    // messages and validates the certificate binding.
    let fingerprint = verify_peer_cert(
        &cert.cert_der,
        &cert.signature,
        &endpoint_identity.pq_verifying_key(),
    )
    .unwrap();
    assert_eq!(fingerprint, cert.fingerprint);

    // An attacker substituting its own certificate fails the binding.
    let attacker = identity();
    let attacker_cert = DirectCert::generate(&attacker).unwrap();
    assert!(verify_peer_cert(
        &attacker_cert.cert_der,
        &attacker_cert.signature,
        &endpoint_identity.pq_verifying_key(),
    )
    .is_err());
}

/// Established carrying a full peer block round-trips with all metadata.
#[test]
fn established_carries_peer_metadata() {
    let endpoint_identity = identity();
    let cert = DirectCert::generate(&endpoint_identity).unwrap();

    let mut peer = PeerBlock {
        port: 45999,
        supports_direct: true,
        certificate: cert.cert_der.clone(),
        certificate_sig: cert.signature.clone(),
        pq_public: endpoint_identity.pq_verifying_key().as_bytes().to_vec(),
        ed_public: endpoint_identity.ed_verifying_key().to_bytes().to_vec(),
        kem_public: vec![0x55; 1568],
        ecdh_public: vec![0x66; 32],
        ..PeerBlock::default()
    };
    peer.set_ip("198.51.100.23".parse().unwrap());

    let established = build_established([9u8; 16], &ServerParams::default(), peer.clone());
    let Message::Established(decoded) = through_wire(&Message::Established(established)) else {
        panic!("codec changed the message type");
    };

    assert_eq!(decoded.peer, peer);
    assert_eq!(
        decoded.peer.socket_addr().unwrap().to_string(),
        "198.51.100.23:45999"
    );
}
