//! The relay accept loop and per-client connection handling.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use veilnet_core::handshake::{build_established, ServerHandshake, ServerOutcome, ServerParams};
use veilnet_core::session::{
    self, EventKind, PathLabel, SessionConfig, SessionEvent, SessionHandle,
};
use veilnet_core::time::unix_now_ns;
use veilnet_core::wsio::{recv_message, send_message};
use veilnet_core::{tls, EndpointId, HandshakeError, Identity, SessionId};
use veilnet_proto::payload::{ErrorMessage, PeerInfo};
use veilnet_proto::{Capabilities, CloseReason, Decoded, ErrorCode, Message, MessageFlags};

use crate::config::RelayServerConfig;
use crate::error::RelayError;
use crate::rate::RateLimiter;
use crate::registry::{ClientEntry, Registry};

/// The rendezvous relay server
pub struct RelayServer {
    config: RelayServerConfig,
    identity: Arc<Identity>,
    registry: Arc<Registry>,
    params: ServerParams,
}

impl RelayServer {
    /// Build a server from validated configuration and a loaded identity.
    ///
    /// # Errors
    ///
    /// [`RelayError::Config`] when validation fails.
    pub fn new(config: RelayServerConfig, identity: Identity) -> Result<Self, RelayError> {
        config.validate()?;

        let params = ServerParams {
            heartbeat_interval: config.heartbeat_interval(),
            mtu: config.mtu,
            key_rotation_interval: config.key_rotation_interval(),
            capabilities: Capabilities::none().with(Capabilities::DIRECT_P2P),
        };

        Ok(Self {
            config,
            identity: Arc::new(identity),
            registry: Arc::new(Registry::new()),
            params,
        })
    }

    /// Number of currently registered clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// The relay's endpoint id
    #[must_use]
    pub fn relay_id(&self) -> EndpointId {
        self.identity.endpoint_id()
    }

    /// Run the accept loop until the shutdown flag flips.
    ///
    /// # Errors
    ///
    /// [`RelayError::Bind`] / [`RelayError::Tls`] on startup; accepted
    /// connections fail individually without stopping the server.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let tls_config = tls::server_config_from_pem(
            std::path::Path::new(&self.config.tls_cert_file),
            std::path::Path::new(&self.config.tls_key_file),
        )?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        info!(
            addr = %self.config.listen_address,
            id = %hex::encode(&self.relay_id()[..8]),
            "relay listening"
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };

            let Ok((tcp, remote)) = accepted else { continue };

            if self.registry.len() >= self.config.max_clients {
                warn!(%remote, "at capacity, refusing connection");
                continue;
            }

            let server = self.clone();
            let acceptor = acceptor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(tcp, acceptor, shutdown).await {
                    debug!(%remote, error = %e, "connection ended with error");
                }
            });
        }

        info!("relay shut down");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        tcp: TcpStream,
        acceptor: TlsAcceptor,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), HandshakeError> {
        let remote = tcp
            .peer_addr()
            .map_err(|_| HandshakeError::UnexpectedMessage("no remote address"))?;

        let tls_stream = acceptor
            .accept(tcp)
            .await
            .map_err(|_| HandshakeError::UnexpectedMessage("TLS accept failed"))?;

        let mut ws = veilnet_core::direct::accept_ws(tls_stream)
            .await
            .map_err(|_| HandshakeError::UnexpectedMessage("websocket upgrade failed"))?;

        // Run the responder handshake with the pair's session id.
        let (outcome, client_id) = {
            let result = tokio::time::timeout(
                veilnet_core::handshake::HANDSHAKE_TIMEOUT,
                self.drive_handshake(&mut ws),
            )
            .await;

            match result {
                Ok(Ok(ok)) => ok,
                Ok(Err((e, reserved))) => {
                    if let Some(client_id) = reserved {
                        self.registry.release(&client_id);
                    }
                    return Err(e);
                }
                Err(_) => return Err(HandshakeError::Timeout),
            }
        };

        info!(
            client = %hex::encode(&client_id[..8]),
            session = %hex::encode(outcome.session_id),
            %remote,
            "handshake_complete"
        );

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(512);
        let handle = session::spawn(
            ws,
            SessionConfig::new(PathLabel::Peer).with_heartbeat(self.params.heartbeat_interval),
            events_tx,
        );

        let entry = ClientEntry {
            client_id,
            session_id: outcome.session_id,
            addr: remote,
            supports_direct: outcome.capabilities.has(Capabilities::DIRECT_P2P),
            direct_port: outcome.direct_port,
            certificate: outcome.certificate.clone(),
            certificate_sig: outcome.certificate_sig.clone(),
            hello: outcome.client.clone(),
            handle: handle.clone(),
            generation: 0,
        };
        let (generation, displaced) = self.registry.register(entry);

        if let Some(old) = displaced {
            info!(client = %hex::encode(&client_id[..8]), "displacing previous connection");
            old.close(
                CloseReason::AdministrativeShutdown,
                "displaced by newer connection",
            );
        }

        self.publish_peer_info(&client_id, outcome.session_id);

        self.client_loop(client_id, generation, outcome.session_id, handle, events_rx, shutdown)
            .await;

        self.registry.remove(&client_id, generation);
        debug!(client = %hex::encode(&client_id[..8]), "client deregistered");
        Ok(())
    }

    /// Responder handshake plus registry reservation. On error returns the
    /// reserved client id (if any) so the caller can release the slot.
    async fn drive_handshake<S>(
        &self,
        ws: &mut tokio_tungstenite::WebSocketStream<S>,
    ) -> Result<(ServerOutcome, EndpointId), (HandshakeError, Option<EndpointId>)>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut machine = ServerHandshake::new(self.identity.clone());

        let (message, _) = recv_message(ws).await.map_err(|e| (e, None))?;
        let Message::Hello(hello) = message else {
            return Err((HandshakeError::UnexpectedMessage("expected HELLO"), None));
        };

        let client_id = hello.client_id;
        let session_id = self.registry.reserve(client_id);
        let fail = |e: HandshakeError| (e, Some(client_id));

        let challenge = machine
            .handle_hello(&hello, session_id, unix_now_ns())
            .map_err(fail)?;
        send_message(ws, &Message::Challenge(Box::new(challenge)), MessageFlags::none())
            .await
            .map_err(fail)?;

        let (message, _) = recv_message(ws).await.map_err(fail)?;
        let Message::Response(response) = message else {
            return Err(fail(HandshakeError::UnexpectedMessage("expected RESPONSE")));
        };
        let outcome = machine.handle_response(&response).map_err(fail)?;

        let peer_block = self.registry.counterpart_block(&client_id);
        let established = build_established(outcome.session_id, &self.params, peer_block);
        send_message(ws, &Message::Established(established), MessageFlags::none())
            .await
            .map_err(fail)?;

        Ok((outcome, client_id))
    }

    /// Push updated counterpart metadata to an already-established
    /// counterpart (it received a zeroed peer block at handshake time, or
    /// this client just rotated its keys).
    fn publish_peer_info(&self, client_id: &EndpointId, session_id: SessionId) {
        let Some(counterpart) = self.registry.counterpart(client_id) else {
            return;
        };
        let Some(me) = self.registry.get(client_id) else {
            return;
        };

        let message = Message::PeerInfo(PeerInfo {
            session_id,
            peer: me.peer_block(),
        });
        if counterpart.handle.try_send(&message).is_err() {
            warn!("failed to push peer info to counterpart");
        }
    }

    /// Forward traffic between the client and its counterpart until the
    /// session ends.
    async fn client_loop(
        &self,
        client_id: EndpointId,
        generation: u64,
        session_id: SessionId,
        handle: SessionHandle,
        mut events_rx: mpsc::Receiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut limiter = RateLimiter::new(self.config.rate_limit, Duration::from_secs(1));
        let mut rekey: Option<ServerHandshake> = None;

        loop {
            let event = tokio::select! {
                event = events_rx.recv() => event,
                _ = shutdown.changed() => {
                    handle.close(CloseReason::AdministrativeShutdown, "relay shutting down");
                    return;
                }
            };
            let Some(event) = event else { return };

            match event.kind {
                EventKind::Inbound { decoded, raw } => {
                    let Decoded::Message { message, flags } = decoded else { continue };
                    match message {
                        // Opaquely forwarded traffic: data frames, pair key
                        // material, and the re-handshake family (a peer may
                        // run key confirmation through the relay before a
                        // direct channel exists).
                        Message::DataFrame(_)
                        | Message::PeerKey(_)
                        | Message::RehandshakeRequest(_)
                        | Message::RehandshakeResponse(_)
                        | Message::RehandshakeComplete(_) => {
                            if !limiter.check() {
                                let _ = handle.try_send(&Message::Error(ErrorMessage {
                                    code: ErrorCode::RateLimitExceeded as u16,
                                    message: "rate limit exceeded".into(),
                                }));
                                continue;
                            }
                            self.forward(&client_id, raw);
                        }
                        Message::Hello(hello) if flags.has(MessageFlags::KEY_ROTATION) => {
                            let mut machine = ServerHandshake::new(self.identity.clone());
                            match machine.handle_hello(&hello, session_id, unix_now_ns()) {
                                Ok(challenge) => {
                                    let _ = handle
                                        .try_send(&Message::Challenge(Box::new(challenge)));
                                    rekey = Some(machine);
                                }
                                Err(e) => {
                                    warn!(error = %e, "rekey HELLO rejected");
                                    let _ = handle.try_send(&Message::Error(ErrorMessage {
                                        code: ErrorCode::InvalidSignature as u16,
                                        message: "rekey rejected".into(),
                                    }));
                                }
                            }
                        }
                        Message::Response(response) => {
                            if let Some(mut machine) = rekey.take() {
                                match machine.handle_response(&response) {
                                    Ok(outcome) => {
                                        self.finish_rekey(&client_id, generation, &handle, outcome);
                                    }
                                    Err(e) => warn!(error = %e, "rekey RESPONSE rejected"),
                                }
                            }
                        }
                        other => {
                            debug!(
                                msg_type = ?other.msg_type(),
                                "unexpected message from client, ignoring"
                            );
                        }
                    }
                }
                EventKind::Closed { cause } => {
                    debug!(client = %hex::encode(&client_id[..8]), ?cause, "client session closed");
                    return;
                }
            }
        }
    }

    /// Complete an intra-session rekey: refresh the registry entry (the
    /// client's ephemeral keys changed) and republish it to the
    /// counterpart so the pair keys rotate too.
    fn finish_rekey(
        &self,
        client_id: &EndpointId,
        generation: u64,
        handle: &SessionHandle,
        outcome: ServerOutcome,
    ) {
        self.registry.update_advertisement(
            client_id,
            generation,
            outcome.client.clone(),
            outcome.certificate.clone(),
            outcome.certificate_sig.clone(),
            outcome.direct_port,
        );

        let peer_block = self.registry.counterpart_block(client_id);
        let established = build_established(outcome.session_id, &self.params, peer_block);
        let _ = handle.try_send(&Message::Established(established));

        self.publish_peer_info(client_id, outcome.session_id);
        info!(client = %hex::encode(&client_id[..8]), "client rotated session keys");
    }

    /// Forward raw bytes to the counterpart, preserving unknown header
    /// flags; the payload is never decrypted.
    fn forward(&self, client_id: &EndpointId, raw: Vec<u8>) {
        let Some(counterpart) = self.registry.counterpart(client_id) else {
            debug!("no counterpart registered, dropping frame");
            return;
        };

        if counterpart.handle.try_send_raw(raw).is_err() {
            debug!("counterpart queue full or closed, dropping frame");
        }
    }
}
