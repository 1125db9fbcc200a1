//! Endpoint orchestration.
//!
//! An endpoint exclusively owns one virtual device, one identity, one
//! direct-path certificate, zero or one relay session, and zero or one
//! direct session. This module wires them together for the three operating
//! modes:
//!
//! - **relay**: connect to the rendezvous relay, handshake, establish
//!   end-to-end pair keys with the counterpart through the relay, and let
//!   the direct-path manager migrate traffic off the relay when feasible;
//! - **listener** / **connector**: run the four-message handshake directly
//!   between the two endpoints, no relay involved.
//!
//! The device-read task and the direct-path manager share exactly one piece
//! of mutable state, the egress switch; everything else communicates over
//! channels. Shutdown is cooperative through a watch flag, and the device
//! is released last.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{Connector, WebSocketStream};
use tracing::{debug, error, info, warn};
use veilnet_crypto::pq_sign::PqVerifyingKey;
use veilnet_crypto::random::random_16;
use veilnet_crypto::sign::EdVerifyingKey;
use veilnet_crypto::SessionKeySet;
use veilnet_device::{FrameDevice, FrameSink, FrameSource};
use veilnet_proto::payload::{PeerBlock, PeerKey};
use veilnet_proto::{Capabilities, CloseReason, Decoded, Message, MessageFlags};

use crate::cert::{verify_peer_cert, DirectCert, PinStore};
use crate::config::{Config, Mode};
use crate::direct::{DirectConfig, DirectPathManager, EgressSwitch, RehandshakeKeys};
use crate::error::{EndpointError, HandshakeError};
use crate::handshake::{
    build_established, ClientAnnounce, ClientHandshake, ClientOutcome, PairLocalKeys,
    ServerHandshake, ServerParams,
};
use crate::identity::Identity;
use crate::pair::{accept_pair, initiate_pair};
use crate::pipeline::FramePipeline;
use crate::session::{
    self, CloseCause, EventKind, PathLabel, SessionConfig, SessionEvent, SessionHandle,
};
use crate::time::unix_now_ns;
use crate::wsio::{recv_message, send_message};
use crate::{tls, SessionId};

/// Run the endpoint until the shutdown flag flips.
///
/// # Errors
///
/// Fatal startup failures (device, identity, configuration) and exhausted
/// reconnect budgets surface here; transient transport failures are
/// retried internally.
pub async fn run(
    config: Config,
    identity: Arc<Identity>,
    device: Box<dyn FrameDevice>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), EndpointError> {
    config.validate()?;

    match config.mode {
        Mode::Relay => run_relay_mode(config, identity, device, shutdown).await,
        Mode::Listener => run_listener_mode(config, identity, device, shutdown).await,
        Mode::Connector => run_connector_mode(config, identity, device, shutdown).await,
    }
}

/// Why the per-connection event loop returned
enum LoopExit {
    Shutdown,
    PrimaryClosed,
}

/// Shared plumbing for every mode: pipeline, egress switch, device tasks.
struct Plumbing {
    pipeline: Arc<FramePipeline>,
    egress: Arc<EgressSwitch>,
    ingress_tx: mpsc::Sender<Vec<u8>>,
    rotation_rx: mpsc::Receiver<()>,
}

fn start_device_tasks(
    device: Box<dyn FrameDevice>,
    shutdown: watch::Receiver<bool>,
) -> Plumbing {
    let mtu = device.mtu();
    let pipeline = Arc::new(FramePipeline::new(mtu));
    let egress = Arc::new(EgressSwitch::new());
    let (ingress_tx, ingress_rx) = mpsc::channel::<Vec<u8>>(256);
    let (rotation_tx, rotation_rx) = mpsc::channel::<()>(1);

    let (source, sink) = device.split();

    tokio::spawn(device_read_task(
        source,
        pipeline.clone(),
        egress.clone(),
        rotation_tx,
        shutdown.clone(),
    ));
    tokio::spawn(device_write_task(sink, ingress_rx, shutdown));

    Plumbing {
        pipeline,
        egress,
        ingress_tx,
        rotation_rx,
    }
}

async fn device_read_task(
    mut source: Box<dyn FrameSource>,
    pipeline: Arc<FramePipeline>,
    egress: Arc<EgressSwitch>,
    rotation_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = source.recv_frame() => frame,
            _ = shutdown.changed() => return,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "virtual device read failed");
                return;
            }
        };

        if !pipeline.is_ready() {
            // No peer keys yet; frames are dropped and counted.
            pipeline.note_queue_drop();
            continue;
        }

        if pipeline.needs_rotation() {
            let _ = rotation_tx.try_send(());
        }

        match pipeline.encrypt_frame(&frame) {
            Ok(data_frame) => {
                let message = Message::DataFrame(data_frame);
                match message.encode() {
                    Ok(bytes) => {
                        if egress.send_frame(bytes).is_err() {
                            pipeline.note_queue_drop();
                        }
                    }
                    Err(e) => debug!(error = %e, "frame encode failed"),
                }
            }
            Err(e) => debug!(error = %e, "egress frame dropped"),
        }
    }
}

async fn device_write_task(
    mut sink: Box<dyn FrameSink>,
    mut ingress_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = ingress_rx.recv() => frame,
            _ = shutdown.changed() => return,
        };

        let Some(frame) = frame else { return };
        if let Err(e) = sink.send_frame(&frame).await {
            error!(error = %e, "virtual device write failed");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Relay mode
// ---------------------------------------------------------------------------

/// Pair-key state for relay mode.
///
/// Exactly one side of a pair establishes and rotates the keys: the
/// endpoint with the lexicographically smaller endpoint id. The tie-break
/// is deterministic on both sides, so the two clients never cross-install
/// key sets from concurrent PEER_KEY exchanges.
struct PairCtx {
    identity: Arc<Identity>,
    session_id: SessionId,
    local_eph: PairLocalKeys,
    pins: PinStore,
    pipeline: Arc<FramePipeline>,
    manager: Arc<DirectPathManager>,
    pair_ready: bool,
    /// True when this endpoint owns pair-key establishment and rotation
    is_initiator: bool,
    peer_pq: Option<PqVerifyingKey>,
    peer_ed: Option<EdVerifyingKey>,
    peer_kem_public: Vec<u8>,
    peer_ecdh_public: Vec<u8>,
    /// Newest accepted PEER_KEY timestamp; prevents a replayed PEER_KEY
    /// from resetting counters onto used nonces
    last_peer_key_ns: u64,
}

impl PairCtx {
    fn install(&mut self, keys: &SessionKeySet) {
        self.pipeline.install_keys(keys);
        self.manager.set_session(
            self.session_id,
            RehandshakeKeys {
                tx_key: keys.tx_key,
                rx_key: keys.rx_key,
            },
        );
        self.pair_ready = true;
    }

    /// Digest counterpart metadata from ESTABLISHED or PEER_INFO.
    fn on_peer_block(&mut self, block: &PeerBlock, relay: &SessionHandle) {
        if block.is_empty() {
            return;
        }

        let peer_pq = match PqVerifyingKey::from_slice(&block.pq_public) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "peer block carries malformed PQ key");
                return;
            }
        };
        let peer_ed = match ed_from_slice(&block.ed_public) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "peer block carries malformed Ed25519 key");
                return;
            }
        };

        // Pin the peer's direct-path certificate only if its long-term
        // signature verifies.
        let mut direct_addr: Option<SocketAddr> = None;
        if !block.certificate.is_empty() {
            match verify_peer_cert(&block.certificate, &block.certificate_sig, &peer_pq) {
                Ok(fingerprint) => {
                    self.pins.pin(fingerprint);
                    if block.supports_direct {
                        direct_addr = block.socket_addr();
                    }
                }
                Err(e) => {
                    warn!(error = %e, "peer certificate rejected, direct path disabled");
                }
            }
        }
        self.manager.set_peer(direct_addr);

        self.is_initiator = self.identity.endpoint_id() < peer_pq.endpoint_id();
        let kem_changed = self.peer_kem_public != block.kem_public;
        self.peer_pq = Some(peer_pq);
        self.peer_ed = Some(peer_ed);
        self.peer_kem_public = block.kem_public.clone();
        self.peer_ecdh_public = block.ecdh_public.clone();

        // The initiator (re)establishes when it first learns the peer's
        // ephemeral keys, or when they change (peer reconnected).
        if self.is_initiator
            && !self.peer_kem_public.is_empty()
            && (!self.pair_ready || kem_changed)
        {
            self.initiate(relay);
        }

        if self.pair_ready {
            self.manager.try_direct();
        }
    }

    fn initiate(&mut self, relay: &SessionHandle) {
        match initiate_pair(
            &self.identity,
            &self.session_id,
            &self.peer_kem_public,
            &self.peer_ecdh_public,
        ) {
            Ok((peer_key, keys)) => {
                let message = Message::PeerKey(Box::new(peer_key));
                if let Err(e) = relay.try_send(&message) {
                    warn!(error = %e, "failed to send pair key material");
                    return;
                }
                self.install(&keys);
                info!("pair keys established (initiator)");
                self.manager.try_direct();
            }
            Err(e) => warn!(error = %e, "pair key initiation failed"),
        }
    }

    fn on_peer_key(&mut self, peer_key: &PeerKey) {
        if self.is_initiator {
            warn!("unexpected PEER_KEY on the initiating side, dropping");
            return;
        }
        let (Some(peer_pq), Some(peer_ed)) = (&self.peer_pq, &self.peer_ed) else {
            warn!("PEER_KEY before peer identity known, dropping");
            return;
        };

        if peer_key.timestamp_ns <= self.last_peer_key_ns {
            warn!("stale or replayed PEER_KEY, dropping");
            return;
        }

        match accept_pair(
            peer_key,
            &self.local_eph,
            peer_pq,
            peer_ed,
            &self.session_id,
            unix_now_ns(),
        ) {
            Ok(keys) => {
                self.last_peer_key_ns = peer_key.timestamp_ns;
                self.install(&keys);
                info!("pair keys established (acceptor)");
                self.manager.try_direct();
            }
            Err(e) => warn!(error = %e, "rejected PEER_KEY"),
        }
    }

    /// Rotate the pair keys (timer or counter exhaustion)
    fn rotate(&mut self, relay: &SessionHandle) {
        if !self.is_initiator {
            // The peer owns rotation; our egress counter cannot realistically
            // reach the 2^48 ceiling between its rotations.
            warn!("rotation requested on the accepting side, deferring to peer");
            return;
        }
        if self.peer_kem_public.is_empty() {
            return;
        }
        debug!("rotating pair keys");
        self.initiate(relay);
    }
}

async fn run_relay_mode(
    config: Config,
    identity: Arc<Identity>,
    device: Box<dyn FrameDevice>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EndpointError> {
    let local_cert = Arc::new(DirectCert::generate(&identity)?);
    let pins = PinStore::new();

    let mut plumbing = start_device_tasks(device, shutdown.clone());
    let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(1024);

    let manager = DirectPathManager::start(
        DirectConfig::default(),
        local_cert.clone(),
        pins.clone(),
        plumbing.egress.clone(),
        events_tx.clone(),
        shutdown.clone(),
    )
    .await?;

    let announce = ClientAnnounce {
        capabilities: Capabilities::none().with(Capabilities::DIRECT_P2P),
        direct_port: manager.listener_port(),
        certificate: local_cert.cert_der.clone(),
        certificate_sig: local_cert.signature.clone(),
    };

    let mut reconnects: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = connect_and_handshake(
            &config,
            identity.clone(),
            announce.clone(),
            config.handshake_timeout(),
        )
        .await;

        let (ws, outcome) = match connected {
            Ok(ok) => ok,
            Err(e) => {
                reconnects += 1;
                if reconnects >= config.relay.max_reconnects {
                    return Err(EndpointError::RelayConnect(format!(
                        "giving up after {reconnects} attempts: {e}"
                    )));
                }
                warn!(error = %e, attempt = reconnects, "relay connection failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(config.reconnect_interval()) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };
        reconnects = 0;

        info!(
            session = %hex::encode(outcome.session_id),
            "handshake_complete"
        );

        // Discard events from sessions of a previous connection attempt.
        while events_rx.try_recv().is_ok() {}

        let relay_handle = session::spawn(
            ws,
            SessionConfig::new(PathLabel::Relay)
                .with_heartbeat(outcome.params.heartbeat_interval),
            events_tx.clone(),
        );
        plumbing.egress.set_relay(relay_handle.clone());

        let mut pair = PairCtx {
            identity: identity.clone(),
            session_id: outcome.session_id,
            local_eph: outcome.local_eph,
            pins: pins.clone(),
            pipeline: plumbing.pipeline.clone(),
            manager: manager.clone(),
            pair_ready: false,
            is_initiator: false,
            peer_pq: None,
            peer_ed: None,
            peer_kem_public: Vec::new(),
            peer_ecdh_public: Vec::new(),
            last_peer_key_ns: 0,
        };
        pair.on_peer_block(&outcome.peer, &relay_handle);

        let exit = relay_event_loop(
            &config,
            &mut events_rx,
            &mut plumbing,
            &mut pair,
            &relay_handle,
            &manager,
            &mut shutdown,
        )
        .await;

        relay_handle.close(CloseReason::NormalShutdown, "endpoint disconnecting");

        match exit {
            LoopExit::Shutdown => break,
            LoopExit::PrimaryClosed => {
                warn!("relay session lost, reconnecting");
                tokio::select! {
                    () = tokio::time::sleep(config.reconnect_interval()) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    if let Some(direct) = plumbing.egress.direct_handle() {
        direct.close(CloseReason::NormalShutdown, "endpoint disconnecting");
    }

    info!("endpoint shut down");
    Ok(())
}

#[allow(clippy::too_many_lines)]
async fn relay_event_loop(
    config: &Config,
    events_rx: &mut mpsc::Receiver<SessionEvent>,
    plumbing: &mut Plumbing,
    pair: &mut PairCtx,
    relay_handle: &SessionHandle,
    manager: &Arc<DirectPathManager>,
    shutdown: &mut watch::Receiver<bool>,
) -> LoopExit {
    let mut rotation_timer = tokio::time::interval(config.key_rotation_interval());
    rotation_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    rotation_timer.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return LoopExit::Shutdown,

            _ = rotation_timer.tick() => {
                if config.crypto.enable_key_rotation && pair.pair_ready && pair.is_initiator {
                    pair.rotate(relay_handle);
                }
            }

            _ = plumbing.rotation_rx.recv() => {
                // TX counter approaching 2^48: rotate regardless of role.
                if pair.pair_ready {
                    pair.rotate(relay_handle);
                }
            }

            event = events_rx.recv() => {
                let Some(event) = event else { return LoopExit::PrimaryClosed };

                match event.kind {
                    EventKind::Inbound { decoded, .. } => {
                        let Decoded::Message { message, .. } = decoded else { continue };
                        handle_inbound(message, event.path, plumbing, pair, relay_handle);
                    }
                    EventKind::Closed { cause } => match event.path {
                        PathLabel::Relay => {
                            debug!(?cause, "relay session closed");
                            return LoopExit::PrimaryClosed;
                        }
                        PathLabel::Direct => {
                            debug!(?cause, "direct session closed");
                            manager.fall_back();
                        }
                        PathLabel::Peer => {}
                    },
                }
            }
        }
    }
}

fn handle_inbound(
    message: Message,
    path: PathLabel,
    plumbing: &Plumbing,
    pair: &mut PairCtx,
    relay_handle: &SessionHandle,
) {
    match message {
        Message::DataFrame(frame) => {
            // Frames from either path decrypt through the same pipeline:
            // counters are session-wide, not path-wide.
            match plumbing.pipeline.decrypt_frame(&frame) {
                Ok(plaintext) => {
                    if plumbing.ingress_tx.try_send(plaintext).is_err() {
                        plumbing.pipeline.note_queue_drop();
                    }
                }
                Err(e) => debug!(error = %e, ?path, "ingress frame dropped"),
            }
        }
        Message::PeerInfo(info) => {
            if info.session_id == pair.session_id {
                pair.on_peer_block(&info.peer, relay_handle);
            } else {
                warn!("PEER_INFO for unknown session, dropping");
            }
        }
        Message::PeerKey(peer_key) => {
            if peer_key.session_id == pair.session_id {
                pair.on_peer_key(&peer_key);
            } else {
                warn!("PEER_KEY for unknown session, dropping");
            }
        }
        Message::Error(err) => {
            warn!(code = err.code, message = %err.message, "peer reported error");
        }
        other => {
            debug!(msg_type = ?other.msg_type(), "unexpected message, ignoring");
        }
    }
}

type RelayWs = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn connect_and_handshake(
    config: &Config,
    identity: Arc<Identity>,
    announce: ClientAnnounce,
    deadline: Duration,
) -> Result<(RelayWs, ClientOutcome), EndpointError> {
    let connector = if config.relay.tls_skip_verify {
        tls::insecure_client_config()?
    } else {
        tls::ca_client_config(std::path::Path::new(&config.relay.tls_ca_file))?
    };

    let (mut ws, _) = tokio_tungstenite::connect_async_tls_with_config(
        config.relay.url.as_str(),
        None,
        false,
        Some(Connector::Rustls(Arc::new(connector))),
    )
    .await
    .map_err(|e| EndpointError::RelayConnect(e.to_string()))?;

    let outcome = tokio::time::timeout(
        deadline,
        drive_client_handshake(&mut ws, identity, announce, MessageFlags::none()),
    )
    .await
    .map_err(|_| EndpointError::Handshake(HandshakeError::Timeout))??;

    Ok((ws, outcome))
}

/// Run the initiator side of the four-message exchange on a raw stream.
async fn drive_client_handshake<S>(
    ws: &mut WebSocketStream<S>,
    identity: Arc<Identity>,
    announce: ClientAnnounce,
    flags: MessageFlags,
) -> Result<ClientOutcome, HandshakeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut handshake = ClientHandshake::new(identity, announce);

    let hello = handshake.hello()?;
    send_message(ws, &Message::Hello(hello), flags).await?;

    let (message, _) = recv_message(ws).await?;
    let Message::Challenge(challenge) = message else {
        return Err(HandshakeError::UnexpectedMessage("expected CHALLENGE"));
    };
    let response = handshake.handle_challenge(&challenge, unix_now_ns())?;
    send_message(ws, &Message::Response(response), MessageFlags::none()).await?;

    let (message, _) = recv_message(ws).await?;
    let Message::Established(established) = message else {
        return Err(HandshakeError::UnexpectedMessage("expected ESTABLISHED"));
    };
    handshake.handle_established(&established)
}

/// Run the responder side of the four-message exchange on a raw stream.
async fn drive_server_handshake<S>(
    ws: &mut WebSocketStream<S>,
    identity: Arc<Identity>,
    params: &ServerParams,
) -> Result<crate::handshake::ServerOutcome, HandshakeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut handshake = ServerHandshake::new(identity);

    let (message, _) = recv_message(ws).await?;
    let Message::Hello(hello) = message else {
        return Err(HandshakeError::UnexpectedMessage("expected HELLO"));
    };

    let session_id: SessionId = random_16()?;
    let challenge = handshake.handle_hello(&hello, session_id, unix_now_ns())?;
    send_message(ws, &Message::Challenge(Box::new(challenge)), MessageFlags::none()).await?;

    let (message, _) = recv_message(ws).await?;
    let Message::Response(response) = message else {
        return Err(HandshakeError::UnexpectedMessage("expected RESPONSE"));
    };
    let outcome = handshake.handle_response(&response)?;

    let established = build_established(outcome.session_id, params, PeerBlock::default());
    send_message(ws, &Message::Established(established), MessageFlags::none()).await?;

    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Listener / connector modes
// ---------------------------------------------------------------------------

async fn run_listener_mode(
    config: Config,
    identity: Arc<Identity>,
    device: Box<dyn FrameDevice>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EndpointError> {
    let mut plumbing = start_device_tasks(device, shutdown.clone());
    let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(1024);

    let listener = TcpListener::bind(&config.p2p.listen_address)
        .await
        .map_err(|e| EndpointError::RelayConnect(e.to_string()))?;
    info!(addr = %config.p2p.listen_address, "listening for direct peer");

    let acceptor = if config.p2p.tls_enabled {
        let tls_config = tls::server_config_from_pem(
            std::path::Path::new(&config.p2p.tls_cert_file),
            std::path::Path::new(&config.p2p.tls_key_file),
        )?;
        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let params = ServerParams {
        mtu: config.tap.mtu,
        key_rotation_interval: config.key_rotation_interval(),
        ..ServerParams::default()
    };

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        let Ok((tcp, remote)) = accepted else { continue };
        info!(%remote, "direct peer connecting");

        let exit = match &acceptor {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls_stream) => {
                    serve_direct_peer(
                        tls_stream,
                        &identity,
                        &params,
                        &mut plumbing,
                        &events_tx,
                        &mut events_rx,
                        &mut shutdown,
                    )
                    .await
                }
                Err(e) => {
                    warn!(error = %e, "TLS accept failed");
                    continue;
                }
            },
            None => {
                serve_direct_peer(
                    tcp,
                    &identity,
                    &params,
                    &mut plumbing,
                    &events_tx,
                    &mut events_rx,
                    &mut shutdown,
                )
                .await
            }
        };

        if matches!(exit, LoopExit::Shutdown) {
            break;
        }
    }

    info!("endpoint shut down");
    Ok(())
}

/// Accept the WebSocket upgrade, run the responder handshake, then carry
/// frames until the session ends.
async fn serve_direct_peer<S>(
    stream: S,
    identity: &Arc<Identity>,
    params: &ServerParams,
    plumbing: &mut Plumbing,
    events_tx: &mpsc::Sender<SessionEvent>,
    events_rx: &mut mpsc::Receiver<SessionEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> LoopExit
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut ws = match crate::direct::accept_ws(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket upgrade failed");
            return LoopExit::PrimaryClosed;
        }
    };

    let outcome = match tokio::time::timeout(
        crate::handshake::HANDSHAKE_TIMEOUT,
        drive_server_handshake(&mut ws, identity.clone(), params),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(error = %e, "direct handshake failed");
            return LoopExit::PrimaryClosed;
        }
        Err(_) => {
            warn!("direct handshake timed out");
            return LoopExit::PrimaryClosed;
        }
    };

    info!(
        session = %hex::encode(outcome.session_id),
        peer = %hex::encode(&outcome.client.client_id[..8]),
        "handshake_complete"
    );
    plumbing.pipeline.install_keys(&outcome.keys);

    let handle = session::spawn(
        ws,
        SessionConfig::new(PathLabel::Direct).with_heartbeat(params.heartbeat_interval),
        events_tx.clone(),
    );
    plumbing.egress.set_relay(handle.clone());

    // Rekeys arrive as in-session HELLOs carrying the KEY_ROTATION flag.
    let mut rekey: Option<(ServerHandshake, SessionId)> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                handle.close(CloseReason::NormalShutdown, "endpoint disconnecting");
                return LoopExit::Shutdown;
            }

            event = events_rx.recv() => {
                let Some(event) = event else { return LoopExit::PrimaryClosed };
                match event.kind {
                    EventKind::Inbound { decoded, .. } => {
                        let Decoded::Message { message, flags } = decoded else { continue };
                        match message {
                            Message::DataFrame(frame) => {
                                match plumbing.pipeline.decrypt_frame(&frame) {
                                    Ok(plaintext) => {
                                        if plumbing.ingress_tx.try_send(plaintext).is_err() {
                                            plumbing.pipeline.note_queue_drop();
                                        }
                                    }
                                    Err(e) => debug!(error = %e, "ingress frame dropped"),
                                }
                            }
                            Message::Hello(hello) if flags.has(MessageFlags::KEY_ROTATION) => {
                                let mut machine = ServerHandshake::new(identity.clone());
                                match machine.handle_hello(&hello, outcome.session_id, unix_now_ns()) {
                                    Ok(challenge) => {
                                        let _ = handle.try_send(&Message::Challenge(Box::new(challenge)));
                                        rekey = Some((machine, outcome.session_id));
                                    }
                                    Err(e) => warn!(error = %e, "rekey HELLO rejected"),
                                }
                            }
                            Message::Response(response) => {
                                if let Some((mut machine, session_id)) = rekey.take() {
                                    match machine.handle_response(&response) {
                                        Ok(rekeyed) => {
                                            let established = build_established(
                                                session_id,
                                                params,
                                                PeerBlock::default(),
                                            );
                                            let _ = handle.try_send(&Message::Established(established));
                                            plumbing.pipeline.install_keys(&rekeyed.keys);
                                            info!("session keys rotated");
                                        }
                                        Err(e) => warn!(error = %e, "rekey RESPONSE rejected"),
                                    }
                                }
                            }
                            other => debug!(msg_type = ?other.msg_type(), "unexpected message, ignoring"),
                        }
                    }
                    EventKind::Closed { cause } => {
                        log_close(&cause);
                        return LoopExit::PrimaryClosed;
                    }
                }
            }
        }
    }
}

async fn run_connector_mode(
    config: Config,
    identity: Arc<Identity>,
    device: Box<dyn FrameDevice>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EndpointError> {
    let mut plumbing = start_device_tasks(device, shutdown.clone());
    let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(1024);

    let announce = ClientAnnounce::default();
    let mut reconnects: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = dial_peer(&config, identity.clone(), announce.clone()).await;
        let (handle, mut outcome) = match result {
            Ok((ws, outcome)) => {
                reconnects = 0;
                info!(session = %hex::encode(outcome.session_id), "handshake_complete");
                plumbing.pipeline.install_keys(&outcome.keys);
                let handle = session::spawn(
                    ws,
                    SessionConfig::new(PathLabel::Direct)
                        .with_heartbeat(outcome.params.heartbeat_interval),
                    events_tx.clone(),
                );
                plumbing.egress.set_relay(handle.clone());
                (handle, outcome)
            }
            Err(e) => {
                reconnects += 1;
                if reconnects >= config.relay.max_reconnects {
                    return Err(EndpointError::RelayConnect(format!(
                        "giving up after {reconnects} attempts: {e}"
                    )));
                }
                warn!(error = %e, attempt = reconnects, "peer dial failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(config.reconnect_interval()) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        let exit = connector_event_loop(
            &config,
            identity.clone(),
            &mut events_rx,
            &mut plumbing,
            &handle,
            &mut outcome,
            &mut shutdown,
        )
        .await;

        handle.close(CloseReason::NormalShutdown, "endpoint disconnecting");
        match exit {
            LoopExit::Shutdown => break,
            LoopExit::PrimaryClosed => {
                warn!("direct session lost, redialing");
                tokio::select! {
                    () = tokio::time::sleep(config.reconnect_interval()) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!("endpoint shut down");
    Ok(())
}

async fn connector_event_loop(
    config: &Config,
    identity: Arc<Identity>,
    events_rx: &mut mpsc::Receiver<SessionEvent>,
    plumbing: &mut Plumbing,
    handle: &SessionHandle,
    outcome: &mut ClientOutcome,
    shutdown: &mut watch::Receiver<bool>,
) -> LoopExit {
    let mut rotation_timer = tokio::time::interval(config.key_rotation_interval());
    rotation_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    rotation_timer.tick().await;

    // In-flight rekey exchange, if any
    let mut rekey: Option<ClientHandshake> = None;

    let mut start_rekey = |rekey: &mut Option<ClientHandshake>| {
        if rekey.is_some() {
            return;
        }
        let mut machine = ClientHandshake::new(identity.clone(), ClientAnnounce::default());
        match machine.hello() {
            Ok(hello) => {
                let flags = MessageFlags::none().with(MessageFlags::KEY_ROTATION);
                match Message::Hello(hello).encode_with_flags(flags) {
                    Ok(bytes) => {
                        if handle.try_send_raw(bytes).is_ok() {
                            *rekey = Some(machine);
                        }
                    }
                    Err(e) => warn!(error = %e, "rekey HELLO encode failed"),
                }
            }
            Err(e) => warn!(error = %e, "rekey HELLO failed"),
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => return LoopExit::Shutdown,

            _ = rotation_timer.tick() => {
                if config.crypto.enable_key_rotation {
                    start_rekey(&mut rekey);
                }
            }

            _ = plumbing.rotation_rx.recv() => {
                start_rekey(&mut rekey);
            }

            event = events_rx.recv() => {
                let Some(event) = event else { return LoopExit::PrimaryClosed };
                match event.kind {
                    EventKind::Inbound { decoded, .. } => {
                        let Decoded::Message { message, .. } = decoded else { continue };
                        match message {
                            Message::DataFrame(frame) => {
                                match plumbing.pipeline.decrypt_frame(&frame) {
                                    Ok(plaintext) => {
                                        if plumbing.ingress_tx.try_send(plaintext).is_err() {
                                            plumbing.pipeline.note_queue_drop();
                                        }
                                    }
                                    Err(e) => debug!(error = %e, "ingress frame dropped"),
                                }
                            }
                            Message::Challenge(challenge) => {
                                if let Some(machine) = rekey.as_mut() {
                                    match machine.handle_challenge(&challenge, unix_now_ns()) {
                                        Ok(response) => {
                                            let _ = handle.try_send(&Message::Response(response));
                                        }
                                        Err(e) => {
                                            warn!(error = %e, "rekey CHALLENGE rejected");
                                            rekey = None;
                                        }
                                    }
                                }
                            }
                            Message::Established(established) => {
                                if let Some(mut machine) = rekey.take() {
                                    match machine.handle_established(&established) {
                                        Ok(new_outcome) => {
                                            plumbing.pipeline.install_keys(&new_outcome.keys);
                                            *outcome = new_outcome;
                                            info!("session keys rotated");
                                        }
                                        Err(e) => warn!(error = %e, "rekey ESTABLISHED rejected"),
                                    }
                                }
                            }
                            other => debug!(msg_type = ?other.msg_type(), "unexpected message, ignoring"),
                        }
                    }
                    EventKind::Closed { cause } => {
                        log_close(&cause);
                        return LoopExit::PrimaryClosed;
                    }
                }
            }
        }
    }
}

type PeerWs = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn dial_peer(
    config: &Config,
    identity: Arc<Identity>,
    announce: ClientAnnounce,
) -> Result<(PeerWs, ClientOutcome), EndpointError> {
    let (scheme, connector) = if config.p2p.tls_enabled {
        let tls_config = if config.p2p.tls_skip_verify {
            tls::insecure_client_config()?
        } else {
            // The listener's own certificate doubles as the trust anchor.
            tls::ca_client_config(std::path::Path::new(&config.p2p.tls_cert_file))?
        };
        ("wss", Some(Connector::Rustls(Arc::new(tls_config))))
    } else {
        ("ws", Some(Connector::Plain))
    };

    let url = format!("{scheme}://{}/ws", config.p2p.peer_address);
    let (mut ws, _) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
            .await
            .map_err(|e| EndpointError::RelayConnect(e.to_string()))?;

    let outcome = tokio::time::timeout(
        crate::handshake::HANDSHAKE_TIMEOUT,
        drive_client_handshake(&mut ws, identity, announce, MessageFlags::none()),
    )
    .await
    .map_err(|_| EndpointError::Handshake(HandshakeError::Timeout))??;

    Ok((ws, outcome))
}

fn log_close(cause: &CloseCause) {
    match cause {
        CloseCause::Remote(reason) => info!(reason, "peer closed the session"),
        CloseCause::IdleTimeout => warn!("session idle timeout"),
        CloseCause::Transport(e) => warn!(error = %e, "session transport failed"),
    }
}

fn ed_from_slice(slice: &[u8]) -> Result<EdVerifyingKey, veilnet_crypto::CryptoError> {
    if slice.len() != 32 {
        return Err(veilnet_crypto::CryptoError::InvalidPublicKey);
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(slice);
    EdVerifyingKey::from_bytes(&bytes)
}
