//! Development policy manager. Grants every request it can.
//!
//! Listens on a Unix domain socket and answers resource sets with the
//! same wire protocol a real policy authority would speak. It does no
//! arbitration between clients: a request is granted unless one of its
//! mandatory types is on the configured deny list.
//!
//! Architecture: channel-based actor. A single manager loop owns all
//! mutable state ([`state::ManagerState`]). Per-connection tasks
//! forward requests via an mpsc channel and get their replies over a
//! oneshot. Unsolicited pushes go through per-connection channels.

mod connection;
mod handler;
pub mod state;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use connection::{DisconnectNotice, ManagerCommand};
use state::{ConnectionId, ManagerState};

use crate::config::{self, ConfigError, ManagerConfig};
use crate::ipc::protocol::Message;

/// How long connections get to flush their last pushes on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Manager startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("manager already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the manager daemon until SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns `ManagerError` if no socket path can be resolved, socket
/// bind fails, or another manager is already running.
pub async fn run(config: ManagerConfig) -> Result<(), ManagerError> {
    let socket_path = config::resolve_socket_path()?;
    let listener = bind_socket(&socket_path).await?;

    tracing::info!(
        path = %socket_path.display(),
        deny = ?config.deny,
        "manager listening"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    };

    let revoked = serve(listener, config, shutdown).await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!(error = %e, path = %socket_path.display(), "failed to remove socket");
    }

    tracing::info!(revoked, "manager stopped");
    Ok(())
}

/// Serve connections on `listener` until `shutdown` resolves.
///
/// On shutdown every holder is sent `released_by_manager` and open
/// connections get [`SHUTDOWN_GRACE`] to flush. Returns the number of
/// grants revoked.
pub async fn serve(
    listener: UnixListener,
    config: ManagerConfig,
    shutdown: impl Future<Output = ()>,
) -> usize {
    // Channels for connection → manager communication.
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ManagerCommand>();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<DisconnectNotice>();

    // Per-connection channels for unsolicited pushes.
    let mut push_senders: HashMap<ConnectionId, mpsc::UnboundedSender<Message>> = HashMap::new();

    let mut state = ManagerState::new(config);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // -- New connection --
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        accept_connection(stream, &cmd_tx, &disconnect_tx, &mut push_senders);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }

            // -- Request from connection task --
            Some(cmd) = cmd_rx.recv() => {
                let responses = handler::handle_message(
                    &mut state,
                    cmd.request,
                    cmd.connection_id,
                );
                let _ = cmd.response_tx.send(responses);
            }

            // -- Connection disconnected --
            Some(notice) = disconnect_rx.recv() => {
                let conn_id = notice.connection_id;
                push_senders.remove(&conn_id);
                if let Some(set_id) = state.remove_connection(conn_id) {
                    tracing::debug!(?conn_id, set_id, "set released implicitly");
                }
            }

            () = &mut shutdown => break,
        }
    }

    // Unblock tasks waiting on a reply that will never come.
    drop(cmd_rx);
    drop(listener);

    let revoked = state.release_all();
    for (conn_id, set_id) in &revoked {
        if let Some(tx) = push_senders.get(conn_id) {
            let _ = tx.send(Message::ReleasedByManager {
                id: 0,
                set_id: *set_id,
            });
        }
    }

    // Closing the push channels ends each connection once it has
    // written what is queued.
    let mut live = push_senders.len();
    push_senders.clear();
    let grace = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(grace);
    while live > 0 {
        tokio::select! {
            Some(_) = disconnect_rx.recv() => live -= 1,
            () = &mut grace => {
                tracing::warn!(live, "connections still open after grace period");
                break;
            }
        }
    }

    revoked.len()
}

/// Accept a new connection: create channels and spawn the handler task.
fn accept_connection(
    stream: UnixStream,
    cmd_tx: &mpsc::UnboundedSender<ManagerCommand>,
    disconnect_tx: &mpsc::UnboundedSender<DisconnectNotice>,
    push_senders: &mut HashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
) {
    let conn_id = ConnectionId::new();
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    push_senders.insert(conn_id, push_tx);

    connection::spawn_connection(
        stream,
        conn_id,
        cmd_tx.clone(),
        push_rx,
        disconnect_tx.clone(),
    );

    tracing::debug!(?conn_id, "accepted connection");
}

// -- Socket setup --

/// Create the socket directory and bind the Unix listener.
///
/// Handles stale socket detection: if EADDRINUSE, attempts to connect
/// to the existing socket. If the connection succeeds, another manager
/// is running. If it fails, the socket is stale and is removed.
pub async fn bind_socket(path: &Path) -> Result<UnixListener, ManagerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| ManagerError::MkdirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(
                |e| ManagerError::MkdirFailed {
                    path: parent.to_path_buf(),
                    source: e,
                },
            )?;
        }
    }

    let bind_failed = |e| ManagerError::BindFailed {
        path: path.to_path_buf(),
        source: e,
    };

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(ManagerError::AlreadyRunning(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(bind_failed)?;
            UnixListener::bind(path).map_err(bind_failed)
        }
        Err(e) => Err(bind_failed(e)),
    }
}
