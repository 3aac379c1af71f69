//! Notification dispatch: manager notifications to caller events.
//!
//! Pure logic, no I/O. [`dispatch`] applies one raw [`Notification`] to
//! the negotiation state and returns the deduplicated event, if any,
//! plus a follow-up request the set must issue.

use std::collections::BTreeSet;

use crate::resource::ResourceType;
use crate::transport::{Notification, RequestId};

use super::state::{AcquireState, ConnectionState, Negotiation};

/// Event delivered to the owner of a resource set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    ManagerIsUp,
    ResourcesGranted(BTreeSet<ResourceType>),
    ResourcesDenied,
    ResourcesReleased,
    ResourcesBecameAvailable(BTreeSet<ResourceType>),
    LostResources,
    ResourcesReleasedByManager,
    UpdateOk,
    Error { code: u32, message: String },
    /// Attributes of a resource changed while connected; picked up by
    /// the next update or acquire.
    PropertiesChanged(ResourceType),
}

/// [`ResourceEvent::Error`] code for a request that never reached the
/// manager. Manager-assigned codes start at 1.
pub const SEND_FAILED: u32 = 0;

/// Request the set must send as a consequence of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FollowUp {
    /// Acquire queued during a release, now that the release is done.
    Acquire,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub event: Option<ResourceEvent>,
    pub follow_up: Option<FollowUp>,
}

impl Dispatch {
    fn emit(event: ResourceEvent) -> Self {
        Self {
            event: Some(event),
            follow_up: None,
        }
    }

    fn absorb() -> Self {
        Self::default()
    }
}

/// Apply `notification` and return what the caller gets to see.
pub(crate) fn dispatch(
    n: &mut Negotiation,
    notification: Notification,
    auto_release: bool,
) -> Dispatch {
    match notification {
        Notification::ManagerUp => manager_up(n),
        Notification::Granted(resources) => granted(n, resources),
        Notification::Denied => denied(n),
        Notification::Released => released(n),
        Notification::Lost => lost(n, auto_release),
        Notification::ReleasedByManager => released_by_manager(n),
        Notification::Available(resources) => {
            Dispatch::emit(ResourceEvent::ResourcesBecameAvailable(resources))
        }
        Notification::UpdateOk { request } => update_ok(n, request),
        Notification::Error {
            request,
            code,
            message,
        } => error(n, request, code, message),
        Notification::Disconnected => disconnected(n),
    }
}

fn manager_up(n: &mut Negotiation) -> Dispatch {
    match n.connection {
        ConnectionState::Connecting => {
            n.connection = ConnectionState::Connected;
            Dispatch::emit(ResourceEvent::ManagerIsUp)
        }
        // Already up, or a late ack after we closed.
        ConnectionState::Connected | ConnectionState::Disconnected => Dispatch::absorb(),
    }
}

fn granted(n: &mut Negotiation, resources: BTreeSet<ResourceType>) -> Dispatch {
    match n.acquisition {
        AcquireState::AcquirePending => {
            n.acquisition = AcquireState::Held;
            n.in_flight = None;
        }
        AcquireState::Held => {
            if n.granted == resources {
                return Dispatch::absorb();
            }
        }
        AcquireState::Idle if n.awaiting_regrant => {
            n.acquisition = AcquireState::Held;
            n.awaiting_regrant = false;
        }
        // Superseded by a release, or stray.
        AcquireState::Idle | AcquireState::ReleasePending { .. } => return Dispatch::absorb(),
    }
    n.granted = resources.clone();
    Dispatch::emit(ResourceEvent::ResourcesGranted(resources))
}

fn denied(n: &mut Negotiation) -> Dispatch {
    match n.acquisition {
        AcquireState::AcquirePending => {
            n.acquisition = AcquireState::Idle;
            n.in_flight = None;
            Dispatch::emit(ResourceEvent::ResourcesDenied)
        }
        _ => {
            n.awaiting_regrant = false;
            Dispatch::absorb()
        }
    }
}

fn released(n: &mut Negotiation) -> Dispatch {
    let AcquireState::ReleasePending { was_held } = n.acquisition else {
        return Dispatch::absorb();
    };
    n.acquisition = AcquireState::Idle;
    n.in_flight = None;
    n.granted.clear();

    Dispatch {
        event: was_held.then_some(ResourceEvent::ResourcesReleased),
        follow_up: std::mem::take(&mut n.queued_acquire).then_some(FollowUp::Acquire),
    }
}

fn lost(n: &mut Negotiation, auto_release: bool) -> Dispatch {
    if n.acquisition != AcquireState::Held {
        return Dispatch::absorb();
    }
    n.acquisition = AcquireState::Idle;
    n.granted.clear();
    // Without auto-release the manager keeps the request and may grant
    // it again on its own.
    n.awaiting_regrant = !auto_release;
    Dispatch::emit(ResourceEvent::LostResources)
}

fn released_by_manager(n: &mut Negotiation) -> Dispatch {
    if n.acquisition != AcquireState::Held {
        return Dispatch::absorb();
    }
    n.acquisition = AcquireState::Idle;
    n.granted.clear();
    n.awaiting_regrant = false;
    Dispatch::emit(ResourceEvent::ResourcesReleasedByManager)
}

fn update_ok(n: &mut Negotiation, request: RequestId) -> Dispatch {
    let Some(pos) = n.pending_updates.iter().position(|&id| id == request) else {
        return Dispatch::absorb();
    };
    n.pending_updates.remove(pos);
    Dispatch::emit(ResourceEvent::UpdateOk)
}

fn error(n: &mut Negotiation, request: RequestId, code: u32, message: String) -> Dispatch {
    if n.in_flight.is_some_and(|id| id == request) {
        // Roll back to the state before the failed request.
        n.acquisition = match n.acquisition {
            AcquireState::ReleasePending { was_held: true } => AcquireState::Held,
            _ => AcquireState::Idle,
        };
        n.in_flight = None;
        n.queued_acquire = false;
    }
    if let Some(pos) = n.pending_updates.iter().position(|&id| id == request) {
        n.pending_updates.remove(pos);
    }
    Dispatch::emit(ResourceEvent::Error { code, message })
}

fn disconnected(n: &mut Negotiation) -> Dispatch {
    if n.is_disconnected() {
        return Dispatch::absorb();
    }
    // The manager drops every request of a closed connection, so each
    // reported phase gets its terminal event here.
    match n.reset() {
        AcquireState::Held => Dispatch::emit(ResourceEvent::LostResources),
        AcquireState::AcquirePending => Dispatch::emit(ResourceEvent::ResourcesDenied),
        AcquireState::ReleasePending { was_held: true } => {
            Dispatch::emit(ResourceEvent::ResourcesReleased)
        }
        AcquireState::ReleasePending { was_held: false } | AcquireState::Idle => {
            Dispatch::absorb()
        }
    }
}
