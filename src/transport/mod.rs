//! Transport boundary between a resource set and the policy manager.
//!
//! A [`Transport`] is exclusively owned by one resource set. Requests
//! are fire-and-forget: each send returns as soon as the request is
//! queued, and the manager's answers come back later as
//! [`Notification`]s on the channel handed over in
//! [`Transport::connect`].

mod unix;

use std::collections::BTreeSet;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::config::ConfigError;
use crate::resource::{Resource, ResourceType};

pub use unix::UnixTransport;

/// Id the transport assigned to an outgoing request. 0 is the handshake.
pub type RequestId = u32;

/// Sending half of a resource set's notification channel.
pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// Session-level data sent once, in the connect handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub set_id: u32,
    pub application_class: String,
    pub auto_release: bool,
    pub always_reply: bool,
}

/// Raw notification from the manager, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Handshake accepted.
    ManagerUp,
    Granted(BTreeSet<ResourceType>),
    Denied,
    /// Confirmation of a release request.
    Released,
    /// The manager preempted the current grant.
    Lost,
    /// The manager forced a release.
    ReleasedByManager,
    Available(BTreeSet<ResourceType>),
    UpdateOk {
        request: RequestId,
    },
    Error {
        request: RequestId,
        code: u32,
        message: String,
    },
    /// The connection to the manager is gone.
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no manager socket: {0}")]
    NoSocketPath(#[from] ConfigError),
    #[error("connect to {path} failed: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("transport requires a tokio runtime")]
    NoRuntime,
    #[error("not connected to the manager")]
    NotConnected,
    #[error("connection to the manager closed")]
    Closed,
}

/// Request side of the connection to the policy manager.
pub trait Transport {
    /// Open the connection and send the registration handshake.
    ///
    /// Idempotent: calling it on a live connection does nothing.
    fn connect(
        &mut self,
        registration: &Registration,
        notifications: NotificationSender,
    ) -> Result<(), TransportError>;

    fn send_acquire(
        &mut self,
        set_id: u32,
        application_class: &str,
        resources: &[Resource],
    ) -> Result<RequestId, TransportError>;

    fn send_release(&mut self, set_id: u32) -> Result<RequestId, TransportError>;

    fn send_update(&mut self, set_id: u32, resources: &[Resource])
    -> Result<RequestId, TransportError>;

    /// Close the connection after flushing queued requests.
    fn disconnect(&mut self);
}
