//! Transport sessions.
//!
//! A session wraps a single authenticated WebSocket stream (relay or
//! direct). It owns three tasks: a reader that decodes and dispatches
//! inbound messages, a writer that serializes everything outbound through a
//! bounded queue (exactly one writer per stream), and a heartbeat timer
//! that doubles as the liveness check. Producers never block: when the
//! writer queue is full the message is dropped and counted by the caller.
//!
//! States move monotonically `Handshaking → Established → Closing →
//! Closed`. The handshake itself runs on the raw stream before the session
//! is spawned, so spawned sessions begin in `Established`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};
use veilnet_proto::payload::{Close, Heartbeat};
use veilnet_proto::{CloseReason, Decoded, Message};

use crate::error::SessionError;
use crate::time::unix_now_ns;

/// Session lifecycle states; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// The handshake is still running on the raw stream (pre-spawn)
    Handshaking,
    /// Normal operation
    Established,
    /// CLOSE sent or received; draining
    Closing,
    /// The stream is gone
    Closed,
}

/// Which transport a session rides on, carried in every event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLabel {
    /// The rendezvous relay connection
    Relay,
    /// A direct peer-to-peer connection
    Direct,
    /// A client connection, as seen from the relay server
    Peer,
}

/// Why a session ended
#[derive(Debug, Clone)]
pub enum CloseCause {
    /// The peer sent CLOSE with this reason code
    Remote(u16),
    /// No inbound traffic for three heartbeat intervals
    IdleTimeout,
    /// The underlying stream failed
    Transport(String),
}

/// What a session reports to its owner
#[derive(Debug)]
pub struct SessionEvent {
    /// Which session produced the event
    pub path: PathLabel,
    /// The event itself
    pub kind: EventKind,
}

/// Event payloads
#[derive(Debug)]
pub enum EventKind {
    /// An inbound message (heartbeats are consumed internally)
    Inbound {
        /// The decoded message with its header flags
        decoded: Decoded,
        /// The raw wire bytes, for opaque forwarding
        raw: Vec<u8>,
    },
    /// The session reached `Closed`
    Closed {
        /// Why
        cause: CloseCause,
    },
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat interval; liveness cutoff is three times this
    pub heartbeat_interval: Duration,
    /// Bounded writer queue depth
    pub queue_capacity: usize,
    /// Label for events and logs
    pub label: PathLabel,
}

impl SessionConfig {
    /// Config with the default 30 s heartbeat
    #[must_use]
    pub fn new(label: PathLabel) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 256,
            label,
        }
    }

    /// Override the heartbeat interval
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Close(Vec<u8>),
}

struct Shared {
    state: Mutex<SessionState>,
    last_rx_ns: AtomicU64,
    shutdown: watch::Sender<bool>,
    label: PathLabel,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    /// Monotonic transition; returns false if already at or past `next`.
    fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().expect("state lock");
        if *state >= next {
            return false;
        }
        *state = next;
        true
    }
}

/// Handle to a running session. Cloneable; all clones feed the same writer.
#[derive(Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Enqueue a message without blocking.
    ///
    /// # Errors
    ///
    /// [`SessionError::QueueFull`] when the writer queue is full (the caller
    /// drops and counts), [`SessionError::Closed`] once the session is
    /// closing or closed.
    pub fn try_send(&self, message: &Message) -> Result<(), SessionError> {
        let bytes = message
            .encode()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.try_send_raw(bytes)
    }

    /// Enqueue pre-encoded wire bytes without blocking (opaque forwarding;
    /// preserves unknown header flags).
    ///
    /// # Errors
    ///
    /// As [`Self::try_send`].
    pub fn try_send_raw(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        if self.shared.state() >= SessionState::Closing {
            return Err(SessionError::Closed);
        }
        self.outbound
            .try_send(Outbound::Frame(bytes))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
            })
    }

    /// Enqueue a message, waiting for queue space (control traffic).
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] if the session ends first.
    pub async fn send(&self, message: &Message) -> Result<(), SessionError> {
        let bytes = message
            .encode()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        if self.shared.state() >= SessionState::Closing {
            return Err(SessionError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(bytes))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Send a best-effort CLOSE and begin shutdown. Idempotent: a second
    /// call on a closing or closed session is a no-op.
    pub fn close(&self, reason: CloseReason, text: &str) {
        if !self.shared.advance(SessionState::Closing) {
            return;
        }

        debug!(label = ?self.shared.label, ?reason, "session closing");

        let close = Message::Close(Close {
            reason: reason as u16,
            message: text.to_string(),
        });
        if let Ok(bytes) = close.encode() {
            // Queued behind pending frames: the writer drains, sends the
            // CLOSE, then shuts the stream.
            let _ = self.outbound.try_send(Outbound::Close(bytes));
        }
        let _ = self.shared.shutdown.send(true);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Whether the session can still carry traffic
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.state() < SessionState::Closing
    }
}

/// Spawn the reader/writer/heartbeat tasks over an established WebSocket
/// stream and return the handle.
pub fn spawn<S>(
    ws: WebSocketStream<S>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shared = Arc::new(Shared {
        state: Mutex::new(SessionState::Established),
        last_rx_ns: AtomicU64::new(unix_now_ns()),
        shutdown: shutdown_tx,
        label: config.label,
    });

    let (sink, stream) = ws.split();

    tokio::spawn(writer_task(
        sink,
        outbound_rx,
        shared.clone(),
        events.clone(),
    ));
    tokio::spawn(reader_task(
        stream,
        shared.clone(),
        events.clone(),
        outbound_tx.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(heartbeat_task(
        config,
        shared.clone(),
        events,
        outbound_tx.clone(),
        shutdown_rx,
    ));

    SessionHandle {
        outbound: outbound_tx,
        shared,
    }
}

/// Emit the Closed event if this caller performed the transition.
async fn finish(
    shared: &Shared,
    events: &mpsc::Sender<SessionEvent>,
    cause: CloseCause,
) {
    let was_open = shared.advance(SessionState::Closed);
    let _ = shared.shutdown.send(true);
    if was_open {
        let _ = events
            .send(SessionEvent {
                path: shared.label,
                kind: EventKind::Closed { cause },
            })
            .await;
    }
}

async fn writer_task<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    events: mpsc::Sender<SessionEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                if let Err(e) = sink.send(WsMessage::Binary(bytes.into())).await {
                    finish(&shared, &events, CloseCause::Transport(e.to_string())).await;
                    return;
                }
            }
            Outbound::Close(bytes) => {
                // Best-effort CLOSE, then shut the stream down.
                let _ = sink.send(WsMessage::Binary(bytes.into())).await;
                let _ = sink.flush().await;
                let _ = sink.close().await;
                shared.advance(SessionState::Closed);
                return;
            }
        }
    }
}

async fn reader_task<S>(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    events: mpsc::Sender<SessionEvent>,
    outbound: mpsc::Sender<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = shutdown.changed() => return,
        };

        match next {
            Some(Ok(WsMessage::Binary(data))) => {
                shared.last_rx_ns.store(unix_now_ns(), Ordering::Relaxed);

                match Message::decode(&data) {
                    Ok(Decoded::Message { message, flags }) => match message {
                        Message::Heartbeat(hb) => {
                            let ack = Message::HeartbeatAck(Heartbeat {
                                timestamp_ns: hb.timestamp_ns,
                            });
                            if let Ok(bytes) = ack.encode() {
                                let _ = outbound.try_send(Outbound::Frame(bytes));
                            }
                        }
                        Message::HeartbeatAck(_) => {
                            trace!(label = ?shared.label, "heartbeat ack");
                        }
                        Message::Close(close) => {
                            debug!(label = ?shared.label, reason = close.reason, "peer closed session");
                            finish(&shared, &events, CloseCause::Remote(close.reason)).await;
                            return;
                        }
                        other => {
                            let decoded = Decoded::Message {
                                message: other,
                                flags,
                            };
                            let raw = data.to_vec();
                            if events
                                .send(SessionEvent {
                                    path: shared.label,
                                    kind: EventKind::Inbound { decoded, raw },
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    },
                    Ok(Decoded::IgnoredManagement { msg_type }) => {
                        warn!(label = ?shared.label, msg_type, "ignoring unknown management message");
                    }
                    Err(e) => {
                        warn!(label = ?shared.label, error = %e, "dropping undecodable message");
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                finish(&shared, &events, CloseCause::Transport("stream ended".into())).await;
                return;
            }
            Some(Ok(_)) => {
                // Text/ping/pong frames are not part of the protocol.
                trace!(label = ?shared.label, "ignoring non-binary websocket frame");
            }
            Some(Err(e)) => {
                finish(&shared, &events, CloseCause::Transport(e.to_string())).await;
                return;
            }
        }
    }
}

async fn heartbeat_task(
    config: SessionConfig,
    shared: Arc<Shared>,
    events: mpsc::Sender<SessionEvent>,
    outbound: mpsc::Sender<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the first heartbeat goes
    // out one interval after establishment.
    ticker.tick().await;

    let idle_cutoff_ns = config.heartbeat_interval.as_nanos() as u64 * 3;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        if shared.state() != SessionState::Established {
            return;
        }

        let idle_ns = unix_now_ns().saturating_sub(shared.last_rx_ns.load(Ordering::Relaxed));
        if idle_ns > idle_cutoff_ns {
            warn!(label = ?shared.label, "session idle timeout");
            finish(&shared, &events, CloseCause::IdleTimeout).await;
            return;
        }

        let heartbeat = Message::Heartbeat(Heartbeat {
            timestamp_ns: unix_now_ns(),
        });
        if let Ok(bytes) = heartbeat.encode() {
            let _ = outbound.try_send(Outbound::Frame(bytes));
        }
    }
}
