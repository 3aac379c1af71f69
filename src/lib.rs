//! Client-side resource policy negotiation.
//!
//! An application groups the system resources it needs (audio
//! playback, vibra, LEDs, ...) into a [`ResourceSet`] and negotiates it
//! with a policy manager over a Unix socket. Outcomes arrive
//! asynchronously as [`ResourceEvent`]s.
//!
//! [`manager`] contains a development manager that grants everything
//! not on a deny list, for exercising the library end to end.

pub mod config;
pub mod ipc;
pub mod manager;
pub mod resource;
pub mod resource_set;
pub mod transport;

pub use resource::{AudioAttributes, Resource, ResourceType, StreamTag, VideoAttributes};
pub use resource_set::{
    AcquireState, ConnectionState, ResourceError, ResourceEvent, ResourceSet,
};
pub use transport::{Transport, TransportError, UnixTransport};
