//! Message-level I/O over a raw WebSocket stream.
//!
//! Handshakes (initial, pair, re-handshake) run before a stream is handed
//! to the session tasks; these helpers move single protocol messages across
//! the raw stream during that phase.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;
use veilnet_proto::{Decoded, Message, MessageFlags};

use crate::error::HandshakeError;

/// Send one message with explicit header flags.
///
/// # Errors
///
/// `HandshakeError::UnexpectedMessage` on transport failure (the handshake
/// driver treats any stream loss as a failed exchange).
pub async fn send_message<S>(
    ws: &mut WebSocketStream<S>,
    message: &Message,
    flags: MessageFlags,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = message.encode_with_flags(flags)?;
    ws.send(WsMessage::Binary(bytes.into()))
        .await
        .map_err(|_| HandshakeError::UnexpectedMessage("stream closed while sending"))
}

/// Receive the next protocol message, skipping heartbeats, ignorable
/// management codes, and non-binary frames. Surfaces ERROR messages as
/// [`HandshakeError::PeerError`].
///
/// # Errors
///
/// `HandshakeError::UnexpectedMessage` if the stream ends; codec errors
/// propagate as `HandshakeError::Codec`.
pub async fn recv_message<S>(
    ws: &mut WebSocketStream<S>,
) -> Result<(Message, MessageFlags), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = ws
            .next()
            .await
            .ok_or(HandshakeError::UnexpectedMessage("stream ended"))?
            .map_err(|_| HandshakeError::UnexpectedMessage("stream error"))?;

        let data = match frame {
            WsMessage::Binary(data) => data,
            WsMessage::Close(_) => {
                return Err(HandshakeError::UnexpectedMessage("stream closed"));
            }
            _ => continue,
        };

        match Message::decode(&data)? {
            Decoded::Message { message, flags } => match message {
                Message::Heartbeat(_) | Message::HeartbeatAck(_) => continue,
                Message::Error(err) => {
                    return Err(HandshakeError::PeerError {
                        code: err.code,
                        message: err.message,
                    });
                }
                other => return Ok((other, flags)),
            },
            Decoded::IgnoredManagement { msg_type } => {
                warn!(msg_type, "ignoring unknown management message during handshake");
            }
        }
    }
}
