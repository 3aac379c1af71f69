//! Unix-socket transport: framed MessagePack to the manager daemon.
//!
//! `connect` opens the socket synchronously (a local connect never waits
//! on the manager), queues the `Hello`, and spawns one task that owns
//! the framed stream. Sends go through an unbounded channel so they
//! never block the caller and reach the socket in call order.

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::config;
use crate::ipc::codec::LengthPrefixedCodec;
use crate::ipc::protocol::{
    Message, PROTOCOL_VERSION, ResourceDescriptor, Status, error_code,
};
use crate::resource::Resource;

use super::{Notification, NotificationSender, Registration, RequestId, Transport, TransportError};

/// Transport to a manager listening on a Unix domain socket.
#[derive(Debug, Default)]
pub struct UnixTransport {
    /// `None` resolves the path from the environment at connect time.
    socket_path: Option<PathBuf>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    next_id: u32,
}

impl UnixTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: Some(socket_path.into()),
            outbound: None,
            next_id: 1,
        }
    }

    /// Transport whose socket path comes from [`config::resolve_socket_path`].
    pub fn from_env() -> Self {
        Self::default()
    }

    fn is_open(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send(&mut self, build: impl FnOnce(u32) -> Message) -> Result<RequestId, TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        // 0 = Hello
        let id = self.next_id.max(1);
        self.next_id = id.wrapping_add(1);
        tx.send(build(id)).map_err(|_| TransportError::Closed)?;
        Ok(id)
    }
}

impl Transport for UnixTransport {
    fn connect(
        &mut self,
        registration: &Registration,
        notifications: NotificationSender,
    ) -> Result<(), TransportError> {
        if self.is_open() {
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let path = match &self.socket_path {
            Some(path) => path.clone(),
            None => config::resolve_socket_path()?,
        };

        let connect_err = |source| TransportError::Connect {
            path: path.clone(),
            source,
        };
        let std_stream = std::os::unix::net::UnixStream::connect(&path).map_err(connect_err)?;
        std_stream.set_nonblocking(true).map_err(connect_err)?;
        let stream = {
            let _guard = handle.enter();
            UnixStream::from_std(std_stream).map_err(connect_err)?
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, cannot fail.
        let _ = tx.send(Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            set_id: registration.set_id,
            application_class: registration.application_class.clone(),
            auto_release: registration.auto_release,
            always_reply: registration.always_reply,
        });

        let set_id = registration.set_id;
        handle.spawn(async move {
            run_connection(stream, rx, notifications, set_id).await;
        });

        tracing::debug!(set_id, path = %path.display(), "connected to manager");
        self.outbound = Some(tx);
        self.next_id = 1;
        Ok(())
    }

    fn send_acquire(
        &mut self,
        set_id: u32,
        application_class: &str,
        resources: &[Resource],
    ) -> Result<RequestId, TransportError> {
        self.send(|id| Message::Acquire {
            id,
            set_id,
            application_class: application_class.to_string(),
            resources: resources.iter().map(ResourceDescriptor::from).collect(),
        })
    }

    fn send_release(&mut self, set_id: u32) -> Result<RequestId, TransportError> {
        self.send(|id| Message::Release { id, set_id })
    }

    fn send_update(
        &mut self,
        set_id: u32,
        resources: &[Resource],
    ) -> Result<RequestId, TransportError> {
        self.send(|id| Message::Update {
            id,
            set_id,
            resources: resources.iter().map(ResourceDescriptor::from).collect(),
        })
    }

    fn disconnect(&mut self) {
        // Dropping the sender lets the task flush what is queued and
        // then close the socket.
        self.outbound = None;
    }
}

/// Connection task: writes queued requests, turns incoming frames into
/// notifications.
async fn run_connection(
    stream: UnixStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    notifications: NotificationSender,
    set_id: u32,
) {
    let framed = Framed::new(stream, LengthPrefixedCodec::new());
    let (mut sink, mut inbound) = framed.split();

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!(set_id, error = %e, "send to manager failed");
                        break;
                    }
                }
                None => {
                    // Local disconnect: nobody is listening for notifications.
                    if let Err(e) = sink.close().await {
                        tracing::debug!(set_id, error = %e, "close failed");
                    }
                    return;
                }
            },
            frame = inbound.next() => match frame {
                Some(Ok(msg)) => {
                    let Some(notification) = to_notification(msg) else {
                        continue;
                    };
                    if notifications.send(notification).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(set_id, error = %e, "manager stream error");
                    break;
                }
                None => {
                    tracing::info!(set_id, "manager closed the connection");
                    break;
                }
            },
        }
    }

    // Close the request side first so a reconnect triggered by the
    // notification opens a fresh connection.
    drop(outbound);
    let _ = notifications.send(Notification::Disconnected);
}

/// Map a manager frame to a notification. Client-originated message
/// types are a protocol violation and are dropped.
fn to_notification(msg: Message) -> Option<Notification> {
    let notification = match msg {
        Message::HelloAck {
            status: Status::Ok, ..
        } => Notification::ManagerUp,
        Message::HelloAck {
            status: Status::Error,
            error,
            ..
        } => Notification::Error {
            request: 0,
            code: error_code::INVALID_HELLO,
            message: error.unwrap_or_else(|| "handshake rejected".into()),
        },
        Message::Granted { resources, .. } => Notification::Granted(resources.into_iter().collect()),
        Message::Denied { .. } => Notification::Denied,
        Message::Released { .. } => Notification::Released,
        Message::Lost { .. } => Notification::Lost,
        Message::ReleasedByManager { .. } => Notification::ReleasedByManager,
        Message::Available { resources, .. } => {
            Notification::Available(resources.into_iter().collect())
        }
        Message::UpdateOk { id, .. } => Notification::UpdateOk { request: id },
        Message::Error { id, code, message } => Notification::Error {
            request: id,
            code,
            message,
        },
        other @ (Message::Hello { .. }
        | Message::Acquire { .. }
        | Message::Release { .. }
        | Message::Update { .. }) => {
            tracing::warn!(message = ?other, "unexpected message from manager");
            return None;
        }
    };
    Some(notification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;
    use std::time::Duration;
    use tokio::net::UnixListener;

    fn registration() -> Registration {
        Registration {
            set_id: 11,
            application_class: "player".into(),
            auto_release: false,
            always_reply: true,
        }
    }

    async fn accept(listener: &UnixListener) -> Framed<UnixStream, LengthPrefixedCodec> {
        let (stream, _) = listener.accept().await.unwrap();
        Framed::new(stream, LengthPrefixedCodec::new())
    }

    async fn recv_notification(
        rx: &mut mpsc::UnboundedReceiver<Notification>,
    ) -> Notification {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("notification timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn connect_fails_without_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = UnixTransport::new(dir.path().join("missing.sock"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.connect(&registration(), tx).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(matches!(
            transport.send_release(11),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn connect_requires_runtime() {
        let mut transport = UnixTransport::new("/nonexistent.sock");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            transport.connect(&registration(), tx),
            Err(TransportError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn hello_first_then_requests_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("manager.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let mut transport = UnixTransport::new(&sock);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(&registration(), tx.clone()).unwrap();
        // Second connect on a live connection is a no-op.
        transport.connect(&registration(), tx).unwrap();

        let resources = [Resource::new(ResourceType::AudioPlayback)];
        let acquire_id = transport.send_acquire(11, "player", &resources).unwrap();
        let release_id = transport.send_release(11).unwrap();
        assert_eq!(acquire_id, 1);
        assert_eq!(release_id, 2);

        let mut peer = accept(&listener).await;
        match peer.next().await.unwrap().unwrap() {
            Message::Hello {
                id,
                set_id,
                application_class,
                always_reply,
                ..
            } => {
                assert_eq!(id, 0);
                assert_eq!(set_id, 11);
                assert_eq!(application_class, "player");
                assert!(always_reply);
            }
            other => panic!("expected Hello, got {other:?}"),
        }
        match peer.next().await.unwrap().unwrap() {
            Message::Acquire { id, resources, .. } => {
                assert_eq!(id, 1);
                assert_eq!(resources[0].kind, ResourceType::AudioPlayback);
            }
            other => panic!("expected Acquire, got {other:?}"),
        }
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Release { id: 2, set_id: 11 }
        );
    }

    #[tokio::test]
    async fn manager_frames_become_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("manager.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let mut transport = UnixTransport::new(&sock);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(&registration(), tx).unwrap();
        let mut peer = accept(&listener).await;

        peer.send(Message::HelloAck {
            id: 0,
            status: Status::Ok,
            error: None,
        })
        .await
        .unwrap();
        peer.send(Message::Granted {
            id: 1,
            set_id: 11,
            resources: vec![ResourceType::Leds, ResourceType::AudioPlayback],
        })
        .await
        .unwrap();
        peer.send(Message::UpdateOk { id: 4, set_id: 11 }).await.unwrap();

        assert_eq!(recv_notification(&mut rx).await, Notification::ManagerUp);
        assert_eq!(
            recv_notification(&mut rx).await,
            Notification::Granted([ResourceType::AudioPlayback, ResourceType::Leds].into())
        );
        assert_eq!(
            recv_notification(&mut rx).await,
            Notification::UpdateOk { request: 4 }
        );

        drop(peer);
        assert_eq!(recv_notification(&mut rx).await, Notification::Disconnected);
    }

    #[tokio::test]
    async fn reconnects_after_manager_drop() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("manager.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let mut transport = UnixTransport::new(&sock);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(&registration(), tx.clone()).unwrap();
        drop(accept(&listener).await);
        assert_eq!(recv_notification(&mut rx).await, Notification::Disconnected);

        // Task is gone; wait for the sender to observe it.
        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.is_open() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        transport.connect(&registration(), tx).unwrap();
        let mut peer = accept(&listener).await;
        assert!(matches!(
            peer.next().await.unwrap().unwrap(),
            Message::Hello { .. }
        ));
    }

    #[test]
    fn hello_ack_error_maps_to_error() {
        let notification = to_notification(Message::HelloAck {
            id: 0,
            status: Status::Error,
            error: Some("version_mismatch".into()),
        });
        assert_eq!(
            notification,
            Some(Notification::Error {
                request: 0,
                code: error_code::INVALID_HELLO,
                message: "version_mismatch".into(),
            })
        );
    }

    #[test]
    fn client_messages_are_dropped() {
        assert_eq!(to_notification(Message::Release { id: 1, set_id: 1 }), None);
    }
}
