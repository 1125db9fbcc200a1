//! The direct-path manager.
//!
//! Brings an endpoint from exclusive-relay operation to a direct
//! peer-to-peer session when feasible, and back:
//!
//! - a TLS listener on an ephemeral port, bound at startup so the port can
//!   be advertised through the relay; mutual TLS with pinned fingerprints
//! - a dialer toward the peer address published in ESTABLISHED/PEER_INFO
//! - the three-message HMAC key confirmation over the fresh channel
//! - zero-loss migration of the egress path, and automatic fallback
//!
//! State machine: `Relay → AttemptingDirect → Direct`, with every failed
//! step resolving back to `Relay` and a retry timer rearming the attempt
//! while the peer still advertises direct support.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use veilnet_crypto::mac::{hmac_sha256, verify_proof};
use veilnet_crypto::random::random_32;
use veilnet_proto::payload::{RehandshakeComplete, RehandshakeRequest, RehandshakeResponse};
use veilnet_proto::{CloseReason, Message, MessageFlags};

use crate::cert::{DirectCert, PinStore};
use crate::error::{DirectPathError, HandshakeError, SessionError};
use crate::session::{self, PathLabel, SessionConfig, SessionEvent, SessionHandle};
use crate::time::{unix_now_ns, within_skew};
use crate::tls;
use crate::wsio::{recv_message, send_message};
use crate::SessionId;

/// Deadline for the three-message key confirmation
pub const REHANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the TCP+TLS+WebSocket dial
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection mode; gates which session carries egress frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// All traffic through the rendezvous relay
    Relay,
    /// Dial/confirmation in flight; traffic still on the relay
    AttemptingDirect,
    /// Traffic on the direct peer-to-peer session
    Direct,
}

/// Direct-path tuning
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Attempt rearm interval while in relay mode
    pub retry_interval: Duration,
    /// Health probe interval while direct
    pub health_interval: Duration,
    /// Consecutive health failures before fallback
    pub health_strikes: u32,
    /// Heartbeat interval for the spawned direct session
    pub heartbeat_interval: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            health_strikes: 3,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Session keys used by the re-handshake proofs. A party proves with its
/// own TX key; the peer checks with its RX key (the same bytes).
#[derive(Clone)]
pub struct RehandshakeKeys {
    /// Our transmit key
    pub tx_key: [u8; 32],
    /// Our receive key
    pub rx_key: [u8; 32],
}

/// Initiator side of the key confirmation, run on the raw direct stream.
///
/// # Errors
///
/// Handshake-level failures; the caller converts a timeout into
/// [`DirectPathError::Timeout`] and falls back.
pub async fn rehandshake_initiator<S>(
    ws: &mut WebSocketStream<S>,
    session_id: &SessionId,
    keys: &RehandshakeKeys,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = random_32()?;

    send_message(
        ws,
        &Message::RehandshakeRequest(RehandshakeRequest {
            session_id: *session_id,
            challenge,
            timestamp_ns: unix_now_ns(),
        }),
        MessageFlags::none(),
    )
    .await?;

    let (message, _) = recv_message(ws).await?;
    let Message::RehandshakeResponse(response) = message else {
        return Err(HandshakeError::UnexpectedMessage("expected rehandshake response"));
    };

    if response.session_id != *session_id {
        return Err(HandshakeError::SessionMismatch);
    }
    if !within_skew(response.timestamp_ns, unix_now_ns()) {
        return Err(HandshakeError::ReplayAttack);
    }
    // The responder proved with its TX key, which equals our RX key.
    if !verify_proof(&keys.rx_key, &challenge, &response.proof) {
        return Err(HandshakeError::InvalidSignature);
    }

    send_message(
        ws,
        &Message::RehandshakeComplete(RehandshakeComplete {
            session_id: *session_id,
            proof: hmac_sha256(&keys.tx_key, &response.counter_challenge),
            timestamp_ns: unix_now_ns(),
        }),
        MessageFlags::none(),
    )
    .await?;

    Ok(())
}

/// Responder side of the key confirmation.
///
/// # Errors
///
/// As [`rehandshake_initiator`].
pub async fn rehandshake_responder<S>(
    ws: &mut WebSocketStream<S>,
    session_id: &SessionId,
    keys: &RehandshakeKeys,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (message, _) = recv_message(ws).await?;
    let Message::RehandshakeRequest(request) = message else {
        return Err(HandshakeError::UnexpectedMessage("expected rehandshake request"));
    };

    if request.session_id != *session_id {
        return Err(HandshakeError::SessionMismatch);
    }
    if !within_skew(request.timestamp_ns, unix_now_ns()) {
        return Err(HandshakeError::ReplayAttack);
    }

    let counter_challenge = random_32()?;
    send_message(
        ws,
        &Message::RehandshakeResponse(RehandshakeResponse {
            session_id: *session_id,
            proof: hmac_sha256(&keys.tx_key, &request.challenge),
            counter_challenge,
            timestamp_ns: unix_now_ns(),
        }),
        MessageFlags::none(),
    )
    .await?;

    let (message, _) = recv_message(ws).await?;
    let Message::RehandshakeComplete(complete) = message else {
        return Err(HandshakeError::UnexpectedMessage("expected rehandshake complete"));
    };

    if complete.session_id != *session_id {
        return Err(HandshakeError::SessionMismatch);
    }
    if !within_skew(complete.timestamp_ns, unix_now_ns()) {
        return Err(HandshakeError::ReplayAttack);
    }
    if !verify_proof(&keys.rx_key, &counter_challenge, &complete.proof) {
        return Err(HandshakeError::InvalidSignature);
    }

    Ok(())
}

/// Outcome of flushing the migration buffer
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Frames flushed onto the new session
    pub flushed: usize,
    /// Frames whose flush send failed (logged, not fatal)
    pub failed: usize,
}

const MIGRATION_BUFFER_CAP: usize = 1024;

struct EgressInner {
    active: ConnectionMode,
    relay: Option<SessionHandle>,
    direct: Option<SessionHandle>,
    pausing: bool,
    buffer: VecDeque<Vec<u8>>,
    buffer_dropped: u64,
}

/// The active-egress switch: the single mutex shared between the
/// device-reader and the direct-path manager. Held only for the duration of
/// a route decision or the migration swap.
pub struct EgressSwitch {
    inner: Mutex<EgressInner>,
}

impl Default for EgressSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl EgressSwitch {
    /// Create a switch with no sessions attached
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EgressInner {
                active: ConnectionMode::Relay,
                relay: None,
                direct: None,
                pausing: false,
                buffer: VecDeque::new(),
                buffer_dropped: 0,
            }),
        }
    }

    /// Attach (or replace) the relay session
    pub fn set_relay(&self, handle: SessionHandle) {
        let mut inner = self.inner.lock().expect("egress lock");
        inner.relay = Some(handle);
    }

    /// Route one encoded DATA_FRAME to the active session, or into the
    /// migration buffer while paused.
    ///
    /// # Errors
    ///
    /// [`SessionError::QueueFull`] when dropped under backpressure (buffer
    /// overflow counts the same way); [`SessionError::Closed`] when no
    /// usable session is attached.
    pub fn send_frame(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().expect("egress lock");

        if inner.pausing {
            if inner.buffer.len() >= MIGRATION_BUFFER_CAP {
                inner.buffer_dropped += 1;
                return Err(SessionError::QueueFull);
            }
            inner.buffer.push_back(bytes);
            return Ok(());
        }

        let handle = match inner.active {
            ConnectionMode::Direct => inner.direct.as_ref(),
            _ => inner.relay.as_ref(),
        };
        handle.ok_or(SessionError::Closed)?.try_send_raw(bytes)
    }

    /// Begin capturing outbound frames for migration
    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("egress lock");
        inner.pausing = true;
    }

    /// Swap the active egress to the confirmed direct session and flush the
    /// migration buffer onto it. One lock acquisition covers the whole swap.
    pub fn migrate_to_direct(&self, direct: SessionHandle) -> MigrationReport {
        let mut inner = self.inner.lock().expect("egress lock");

        let mut report = MigrationReport::default();
        while let Some(bytes) = inner.buffer.pop_front() {
            match direct.try_send_raw(bytes) {
                Ok(()) => report.flushed += 1,
                Err(_) => report.failed += 1,
            }
        }

        inner.direct = Some(direct);
        inner.active = ConnectionMode::Direct;
        inner.pausing = false;
        report
    }

    /// Abandon a paused migration and flush captured frames back onto the
    /// relay session.
    pub fn resume_relay(&self) -> MigrationReport {
        let mut inner = self.inner.lock().expect("egress lock");

        let mut report = MigrationReport::default();
        if let Some(relay) = inner.relay.clone() {
            while let Some(bytes) = inner.buffer.pop_front() {
                match relay.try_send_raw(bytes) {
                    Ok(()) => report.flushed += 1,
                    Err(_) => report.failed += 1,
                }
            }
        }
        inner.buffer.clear();
        inner.pausing = false;
        report
    }

    /// Fall back to the relay path, dropping the direct session handle
    pub fn fall_back(&self) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().expect("egress lock");
        inner.active = ConnectionMode::Relay;
        inner.pausing = false;
        inner.direct.take()
    }

    /// The currently active mode as the switch sees it
    #[must_use]
    pub fn active(&self) -> ConnectionMode {
        self.inner.lock().expect("egress lock").active
    }

    /// The relay session handle, if attached
    #[must_use]
    pub fn relay_handle(&self) -> Option<SessionHandle> {
        self.inner.lock().expect("egress lock").relay.clone()
    }

    /// The direct session handle, if attached
    #[must_use]
    pub fn direct_handle(&self) -> Option<SessionHandle> {
        self.inner.lock().expect("egress lock").direct.clone()
    }
}

struct ManagerState {
    mode: ConnectionMode,
    strikes: u32,
    peer: Option<SocketAddr>,
    keys: Option<RehandshakeKeys>,
}

/// Coordinates listener, dialer, key confirmation, migration and fallback
pub struct DirectPathManager {
    config: DirectConfig,
    session_id: Mutex<SessionId>,
    state: Mutex<ManagerState>,
    pins: PinStore,
    local_cert: Arc<DirectCert>,
    egress: Arc<EgressSwitch>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    listener_port: u16,
}

impl DirectPathManager {
    /// Bind the direct listener on an ephemeral port and start its accept
    /// loop plus the retry and health timers. Returns the manager and the
    /// port to advertise.
    ///
    /// # Errors
    ///
    /// [`DirectPathError::Listener`] if the socket cannot be bound.
    pub async fn start(
        config: DirectConfig,
        local_cert: Arc<DirectCert>,
        pins: PinStore,
        egress: Arc<EgressSwitch>,
        events: mpsc::Sender<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, DirectPathError> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| DirectPathError::Listener(e.to_string()))?;
        let listener_port = listener
            .local_addr()
            .map_err(|e| DirectPathError::Listener(e.to_string()))?
            .port();

        let tls_config = tls::pinned_server_config(pins.clone(), &local_cert)?;

        let manager = Arc::new(Self {
            config,
            session_id: Mutex::new([0u8; 16]),
            state: Mutex::new(ManagerState {
                mode: ConnectionMode::Relay,
                strikes: 0,
                peer: None,
                keys: None,
            }),
            pins,
            local_cert,
            egress,
            events,
            shutdown,
            listener_port,
        });

        manager.clone().spawn_accept_loop(listener, tls_config);
        manager.clone().spawn_retry_timer();
        manager.clone().spawn_health_timer();

        info!(port = listener_port, "direct-path listener up");
        Ok(manager)
    }

    /// The ephemeral listener port, advertised in RESPONSE
    #[must_use]
    pub fn listener_port(&self) -> u16 {
        self.listener_port
    }

    /// Install the session id and re-handshake keys (called when pair keys
    /// are established or rotated)
    pub fn set_session(&self, session_id: SessionId, keys: RehandshakeKeys) {
        *self.session_id.lock().expect("session lock") = session_id;
        self.state.lock().expect("state lock").keys = Some(keys);
    }

    /// Record the peer's direct address; `None` withdraws direct support
    pub fn set_peer(&self, peer: Option<SocketAddr>) {
        self.state.lock().expect("state lock").peer = peer;
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> ConnectionMode {
        self.state.lock().expect("state lock").mode
    }

    /// Trigger an attempt now (relay session just established, or a peer
    /// update arrived). No-op unless currently in relay mode with a known
    /// peer and keys.
    pub fn try_direct(self: &Arc<Self>) {
        let attempt = {
            let mut state = self.state.lock().expect("state lock");
            if state.mode != ConnectionMode::Relay {
                None
            } else {
                match (state.peer, state.keys.clone()) {
                    (Some(peer), Some(keys)) => {
                        state.mode = ConnectionMode::AttemptingDirect;
                        Some((peer, keys))
                    }
                    _ => None,
                }
            }
        };

        let Some((peer, keys)) = attempt else {
            return;
        };

        info!(%peer, "attempting direct path");
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_attempt(peer, keys).await;
        });
    }

    async fn run_attempt(self: Arc<Self>, peer: SocketAddr, keys: RehandshakeKeys) {
        let session_id = *self.session_id.lock().expect("session lock");
        let mut shutdown = self.shutdown.clone();

        let attempt = async {
            let mut ws = dial_direct(peer, self.pins.clone(), &self.local_cert).await?;

            tokio::time::timeout(
                REHANDSHAKE_TIMEOUT,
                rehandshake_initiator(&mut ws, &session_id, &keys),
            )
            .await
            .map_err(|_| DirectPathError::Timeout)??;

            Ok::<_, DirectPathError>(ws)
        };

        let result = tokio::select! {
            result = attempt => result,
            _ = shutdown.changed() => Err(DirectPathError::Aborted),
        };

        match result {
            Ok(ws) => {
                let handle = session::spawn(
                    ws,
                    SessionConfig::new(PathLabel::Direct)
                        .with_heartbeat(self.config.heartbeat_interval),
                    self.events.clone(),
                );
                self.promote(handle);
            }
            Err(e) => {
                warn!(error = %e, "direct path attempt failed, staying on relay");
                let mut state = self.state.lock().expect("state lock");
                if state.mode == ConnectionMode::AttemptingDirect {
                    state.mode = ConnectionMode::Relay;
                }
            }
        }
    }

    /// Promote a key-confirmed direct session: pause, swap under the egress
    /// mutex, flush, and release the relay egress role.
    fn promote(&self, handle: SessionHandle) {
        {
            let mut state = self.state.lock().expect("state lock");
            if state.mode == ConnectionMode::Direct {
                // A confirmed session already won (both sides dial); keep it.
                debug!("duplicate direct session, closing the newcomer");
                handle.close(CloseReason::NormalShutdown, "duplicate direct path");
                return;
            }
            state.mode = ConnectionMode::Direct;
            state.strikes = 0;
        }

        self.egress.pause();
        let report = self.egress.migrate_to_direct(handle);
        if report.failed > 0 {
            warn!(failed = report.failed, "some buffered frames failed to flush");
        }

        info!(
            flushed = report.flushed,
            "migrated egress to direct path"
        );
    }

    /// Direct session dropped or failed health checks: fall back to relay.
    pub fn fall_back(&self) {
        {
            let mut state = self.state.lock().expect("state lock");
            if state.mode != ConnectionMode::Direct {
                return;
            }
            state.mode = ConnectionMode::Relay;
            state.strikes = 0;
        }

        if let Some(direct) = self.egress.fall_back() {
            direct.close(CloseReason::NormalShutdown, "falling back to relay");
        }
        warn!("direct path lost, falling back to relay");
    }

    /// An inbound, key-confirmed direct session from the listener side
    fn adopt_inbound(self: &Arc<Self>, handle: SessionHandle) {
        self.promote(handle);
    }

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener, tls: rustls::ServerConfig) {
        let acceptor = TlsAcceptor::from(Arc::new(tls));
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown.changed() => return,
                };

                let Ok((tcp, remote)) = accepted else {
                    continue;
                };

                let manager = self.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match manager.accept_one(tcp, acceptor).await {
                        Ok(handle) => manager.adopt_inbound(handle),
                        Err(e) => {
                            debug!(%remote, error = %e, "inbound direct connection rejected");
                        }
                    }
                });
            }
        });
    }

    async fn accept_one(
        &self,
        tcp: TcpStream,
        acceptor: TlsAcceptor,
    ) -> Result<SessionHandle, DirectPathError> {
        let tls_stream = acceptor
            .accept(tcp)
            .await
            .map_err(|e| DirectPathError::Tls(e.to_string()))?;

        let mut ws = accept_ws(tls_stream).await?;

        let (session_id, keys) = {
            let state = self.state.lock().expect("state lock");
            let keys = state.keys.clone().ok_or(DirectPathError::Rehandshake(
                HandshakeError::UnexpectedMessage("no session keys yet"),
            ))?;
            (*self.session_id.lock().expect("session lock"), keys)
        };

        tokio::time::timeout(
            REHANDSHAKE_TIMEOUT,
            rehandshake_responder(&mut ws, &session_id, &keys),
        )
        .await
        .map_err(|_| DirectPathError::Timeout)??;

        Ok(session::spawn(
            ws,
            SessionConfig::new(PathLabel::Direct).with_heartbeat(self.config.heartbeat_interval),
            self.events.clone(),
        ))
    }

    fn spawn_retry_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let interval = self.config.retry_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                self.try_direct();
            }
        });
    }

    fn spawn_health_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let interval = self.config.health_interval;
        let max_strikes = self.config.health_strikes;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }

                if self.mode() != ConnectionMode::Direct {
                    continue;
                }

                let healthy = self
                    .egress
                    .direct_handle()
                    .is_some_and(|handle| handle.is_open());

                let strikes = {
                    let mut state = self.state.lock().expect("state lock");
                    if healthy {
                        state.strikes = 0;
                    } else {
                        state.strikes += 1;
                    }
                    state.strikes
                };

                if strikes >= max_strikes {
                    self.fall_back();
                }
            }
        });
    }
}

/// Dial the peer's direct listener: TCP, pinned mutual TLS, WebSocket
/// upgrade at `/ws`.
///
/// # Errors
///
/// [`DirectPathError::Dial`] / [`DirectPathError::Tls`] on the respective
/// stage failing; the overall dial is bounded by [`DIAL_TIMEOUT`].
pub async fn dial_direct(
    peer: SocketAddr,
    pins: PinStore,
    local_cert: &DirectCert,
) -> Result<WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>, DirectPathError> {
    let tls_config = Arc::new(tls::pinned_client_config(pins, local_cert)?);

    let dial = async {
        let tcp = TcpStream::connect(peer)
            .await
            .map_err(|e| DirectPathError::Dial(e.to_string()))?;

        let server_name = rustls_pki_types::ServerName::try_from(peer.ip().to_string())
            .map_err(|e| DirectPathError::Tls(e.to_string()))?;

        let tls_stream = TlsConnector::from(tls_config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| DirectPathError::Tls(e.to_string()))?;

        let url = format!("wss://{peer}/ws");
        let (ws, _) = tokio_tungstenite::client_async(url.as_str(), tls_stream)
            .await
            .map_err(|e| DirectPathError::Dial(e.to_string()))?;

        Ok::<_, DirectPathError>(ws)
    };

    tokio::time::timeout(DIAL_TIMEOUT, dial)
        .await
        .map_err(|_| DirectPathError::Timeout)?
}

/// Accept a WebSocket upgrade, requiring the `/ws` path.
///
/// # Errors
///
/// [`DirectPathError::Listener`] when the upgrade fails or targets another
/// path.
pub async fn accept_ws<S>(stream: S) -> Result<WebSocketStream<S>, DirectPathError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response, ErrorResponse};

    let check_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == "/ws" {
            Ok(resp)
        } else {
            Err(ErrorResponse::new(Some("not found".into())))
        }
    };

    tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| DirectPathError::Listener(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            WebSocketStream::from_raw_socket(a, Role::Client, None).await,
            WebSocketStream::from_raw_socket(b, Role::Server, None).await,
        )
    }

    fn mirror_keys() -> (RehandshakeKeys, RehandshakeKeys) {
        (
            RehandshakeKeys {
                tx_key: [1u8; 32],
                rx_key: [2u8; 32],
            },
            RehandshakeKeys {
                tx_key: [2u8; 32],
                rx_key: [1u8; 32],
            },
        )
    }

    #[tokio::test]
    async fn test_rehandshake_success() {
        let (mut a, mut b) = ws_pair().await;
        let (ka, kb) = mirror_keys();
        let session_id = [9u8; 16];

        let responder = tokio::spawn(async move {
            rehandshake_responder(&mut b, &session_id, &kb).await
        });

        rehandshake_initiator(&mut a, &session_id, &ka).await.unwrap();
        responder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rehandshake_wrong_keys_fails() {
        let (mut a, mut b) = ws_pair().await;
        let (ka, _) = mirror_keys();
        let wrong = RehandshakeKeys {
            tx_key: [7u8; 32],
            rx_key: [8u8; 32],
        };
        let session_id = [9u8; 16];

        let responder = tokio::spawn(async move {
            rehandshake_responder(&mut b, &session_id, &wrong).await
        });

        assert!(rehandshake_initiator(&mut a, &session_id, &ka).await.is_err());
        let _ = responder.await;
    }

    #[tokio::test]
    async fn test_rehandshake_session_mismatch() {
        let (mut a, mut b) = ws_pair().await;
        let (ka, kb) = mirror_keys();

        let responder = tokio::spawn(async move {
            rehandshake_responder(&mut b, &[2u8; 16], &kb).await
        });

        let initiator = rehandshake_initiator(&mut a, &[1u8; 16], &ka).await;
        let responder = responder.await.unwrap();

        assert!(initiator.is_err() || responder.is_err());
    }

    #[tokio::test]
    async fn test_egress_switch_migration_preserves_frames() {
        let (a_io, _b_io) = tokio::io::duplex(64 * 1024);
        let ws = WebSocketStream::from_raw_socket(a_io, Role::Client, None).await;
        let (events_tx, _events_rx) = mpsc::channel(16);
        let direct = session::spawn(ws, SessionConfig::new(PathLabel::Direct), events_tx);

        let switch = EgressSwitch::new();
        switch.pause();

        for i in 0..5u8 {
            switch.send_frame(vec![i; 32]).unwrap();
        }

        let report = switch.migrate_to_direct(direct);
        assert_eq!(report.flushed, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(switch.active(), ConnectionMode::Direct);
    }

    #[tokio::test]
    async fn test_egress_switch_no_session() {
        let switch = EgressSwitch::new();
        assert!(matches!(
            switch.send_frame(vec![0u8; 16]),
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_egress_buffer_cap() {
        let switch = EgressSwitch::new();
        switch.pause();

        for _ in 0..MIGRATION_BUFFER_CAP {
            switch.send_frame(vec![0u8; 8]).unwrap();
        }
        assert!(matches!(
            switch.send_frame(vec![0u8; 8]),
            Err(SessionError::QueueFull)
        ));
    }
}
