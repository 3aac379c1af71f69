//! One task per resource set connection.
//!
//! The task registers the set from its `hello`, then relays the set's
//! acquire/release/update requests to the manager loop and writes back
//! every reply. Grant changes caused by other sets (lost, re-granted,
//! released by the manager) reach it on the push channel. When the
//! socket closes, the manager loop is told so it can drop the set's
//! grant.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::{Message, Status, error_code};

use super::handler;
use super::state::ConnectionId;

/// Message types a client may send. A frame naming one of these that
/// fails to decode is malformed rather than unknown.
const CLIENT_TYPES: &[&str] = &["hello", "acquire", "release", "update"];

/// A set's request plus the slot for the manager's replies.
#[derive(Debug)]
pub struct ManagerCommand {
    pub request: Message,
    pub response_tx: oneshot::Sender<Vec<Message>>,
    pub connection_id: ConnectionId,
}

/// The set behind this connection is gone.
#[derive(Debug)]
pub struct DisconnectNotice {
    pub connection_id: ConnectionId,
}

/// Why a set's connection ended early.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("closed before registering a set")]
    HandshakeEof,
    #[error("first message must be hello")]
    NotHello,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("manager loop closed")]
    ManagerGone,
    #[error("response channel closed")]
    ResponseDropped,
}

/// Serve one set's connection on its own task.
///
/// Ends when the client closes, sends an undecodable frame, or the
/// manager shuts down. A [`DisconnectNotice`] follows in every case.
pub fn spawn_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
    push_rx: mpsc::UnboundedReceiver<Message>,
    disconnect_tx: mpsc::UnboundedSender<DisconnectNotice>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, conn_id, cmd_tx, push_rx).await {
            tracing::debug!(?conn_id, error = %e, "connection closed");
        }
        let _ = disconnect_tx.send(DisconnectNotice {
            connection_id: conn_id,
        });
    });
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
    mut push_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Registration --
    let first_frame = framed
        .next()
        .await
        .ok_or(ConnectionError::HandshakeEof)?
        .map_err(ConnectionError::Codec)?;

    let first_msg = match decode_frame(&first_frame) {
        DecodeResult::Ok(msg @ Message::Hello { .. }) => msg,
        DecodeResult::Ok(_) | DecodeResult::UnknownType(_) => {
            return Err(ConnectionError::NotHello);
        }
        DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
    };

    let responses = send_command(&cmd_tx, first_msg, conn_id).await?;
    let rejected = responses.iter().any(is_error_hello_ack);
    send_all(&mut framed, responses).await?;
    if rejected {
        return Ok(());
    }

    // -- Requests and grant pushes --
    loop {
        tokio::select! {
            frame = framed.next() => {
                let raw = match frame {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => return Err(ConnectionError::Codec(e)),
                    None => return Ok(()),
                };
                match decode_frame(&raw) {
                    DecodeResult::Ok(msg) => {
                        let responses = send_command(&cmd_tx, msg, conn_id).await?;
                        send_all(&mut framed, responses).await?;
                    }
                    DecodeResult::UnknownType(envelope) => {
                        // Answer with the echoed id and keep the connection.
                        let response = if CLIENT_TYPES.contains(&envelope.msg_type.as_str()) {
                            handler::error(envelope.id, error_code::MALFORMED, "malformed request")
                        } else {
                            handler::error(envelope.id, error_code::UNKNOWN_TYPE, "unknown message type")
                        };
                        tracing::debug!(?conn_id, msg_type = %envelope.msg_type, "rejected frame");
                        framed.send(response).await?;
                    }
                    DecodeResult::Malformed(e) => {
                        return Err(ConnectionError::MalformedFrame(e));
                    }
                }
            }
            push = push_rx.recv() => {
                match push {
                    Some(msg) => framed.send(msg).await?,
                    // Manager loop is shutting down.
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn send_all(
    framed: &mut Framed<UnixStream, FrameCodec>,
    messages: Vec<Message>,
) -> Result<(), ConnectionError> {
    for msg in messages {
        framed.feed(msg).await?;
    }
    framed.flush().await?;
    Ok(())
}

/// Hand `request` to the manager loop and wait for its replies.
async fn send_command(
    cmd_tx: &mpsc::UnboundedSender<ManagerCommand>,
    request: Message,
    conn_id: ConnectionId,
) -> Result<Vec<Message>, ConnectionError> {
    let (response_tx, response_rx) = oneshot::channel();
    cmd_tx
        .send(ManagerCommand {
            request,
            response_tx,
            connection_id: conn_id,
        })
        .map_err(|_| ConnectionError::ManagerGone)?;
    response_rx
        .await
        .map_err(|_| ConnectionError::ResponseDropped)
}

fn is_error_hello_ack(msg: &Message) -> bool {
    matches!(
        msg,
        Message::HelloAck {
            status: Status::Error,
            ..
        }
    )
}
