//! Negotiation state of one resource set.
//!
//! All methods are pure state transitions with no I/O. The request
//! side lives here (`plan_*` decides, `*_sent` records); the
//! notification side lives in [`super::dispatcher`].

use std::collections::{BTreeSet, VecDeque};

use crate::resource::ResourceType;
use crate::transport::RequestId;

/// Connection to the manager, as seen by one resource set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Transport open, handshake not yet acknowledged.
    Connecting,
    Connected,
}

/// Acquisition phase of a resource set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    Idle,
    AcquirePending,
    Held,
    /// `was_held`: a grant had been reported to the caller when the
    /// release was issued, so its confirmation is reported too.
    ReleasePending { was_held: bool },
}

/// What the set should do for a caller's acquire/release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Send,
    /// Deferred until the in-flight request completes.
    Queued,
    Noop,
}

#[derive(Debug)]
pub(crate) struct Negotiation {
    pub(super) connection: ConnectionState,
    pub(super) acquisition: AcquireState,
    /// Locks the session flags once the first connect succeeded.
    pub(super) ever_connected: bool,
    /// Acquire requested while a release is in flight.
    pub(super) queued_acquire: bool,
    /// Last grant reported to the caller.
    pub(super) granted: BTreeSet<ResourceType>,
    /// The manager still holds our request after a preemption and may
    /// grant it again unprompted.
    pub(super) awaiting_regrant: bool,
    /// Outstanding acquire or release.
    pub(super) in_flight: Option<RequestId>,
    pub(super) pending_updates: VecDeque<RequestId>,
}

impl Negotiation {
    pub fn new() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            acquisition: AcquireState::Idle,
            ever_connected: false,
            queued_acquire: false,
            granted: BTreeSet::new(),
            awaiting_regrant: false,
            in_flight: None,
            pending_updates: VecDeque::new(),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn acquisition(&self) -> AcquireState {
        self.acquisition
    }

    pub fn granted(&self) -> &BTreeSet<ResourceType> {
        &self.granted
    }

    pub fn flags_locked(&self) -> bool {
        self.ever_connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.connection == ConnectionState::Disconnected
    }

    /// Transport opened and handshake queued.
    pub fn connecting(&mut self) {
        self.connection = ConnectionState::Connecting;
        self.ever_connected = true;
    }

    pub fn plan_acquire(&mut self) -> Step {
        match self.acquisition {
            AcquireState::Idle => Step::Send,
            AcquireState::AcquirePending | AcquireState::Held => Step::Noop,
            AcquireState::ReleasePending { .. } => {
                self.queued_acquire = true;
                Step::Queued
            }
        }
    }

    pub fn acquire_sent(&mut self, request: RequestId) {
        self.acquisition = AcquireState::AcquirePending;
        self.in_flight = Some(request);
        self.queued_acquire = false;
        self.awaiting_regrant = false;
    }

    pub fn plan_release(&mut self) -> Step {
        match self.acquisition {
            AcquireState::Held | AcquireState::AcquirePending => Step::Send,
            AcquireState::ReleasePending { .. } => {
                // Latest intent wins.
                self.queued_acquire = false;
                Step::Noop
            }
            AcquireState::Idle if self.awaiting_regrant => Step::Send,
            AcquireState::Idle => Step::Noop,
        }
    }

    pub fn release_sent(&mut self, request: RequestId) {
        let was_held = self.acquisition == AcquireState::Held;
        self.acquisition = AcquireState::ReleasePending { was_held };
        self.in_flight = Some(request);
        self.queued_acquire = false;
        self.awaiting_regrant = false;
    }

    pub fn update_sent(&mut self, request: RequestId) {
        self.pending_updates.push_back(request);
    }

    /// Connection lost or closed. Returns the acquisition phase it
    /// interrupted.
    pub fn reset(&mut self) -> AcquireState {
        let interrupted = self.acquisition;
        self.connection = ConnectionState::Disconnected;
        self.acquisition = AcquireState::Idle;
        self.queued_acquire = false;
        self.granted.clear();
        self.awaiting_regrant = false;
        self.in_flight = None;
        self.pending_updates.clear();
        interrupted
    }
}
