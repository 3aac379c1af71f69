//! Resource set: a named bundle of resources negotiated as a unit.
//!
//! Every public operation is synchronous: it mutates local state and at
//! most queues one request on the transport, then returns. The
//! manager's answers arrive later on the set's notification channel.
//! [`ResourceSet::next_event`] pumps that channel, applies each
//! notification to the negotiation state, and yields only the events
//! that survive deduplication. Events raised locally (property changes,
//! a queued acquire that could not be sent) wait in a queue that is
//! drained first.

mod dispatcher;
mod state;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;

use crate::resource::{Resource, ResourceType};
use crate::transport::{
    Notification, Registration, Transport, TransportError, UnixTransport,
};

use dispatcher::{Dispatch, FollowUp};
use state::{Negotiation, Step};

pub use dispatcher::{ResourceEvent, SEND_FAILED};
pub use state::{AcquireState, ConnectionState};

/// Usage and transport errors of resource set operations.
///
/// Negotiation outcomes (denied, lost, ...) are events, not errors.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("no resource given")]
    MissingResource,
    #[error("{0} cannot change after connecting to the manager")]
    FlagsLocked(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Allocate a process-unique resource set id.
fn next_set_id() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Client-side view of one resource set negotiated with the manager.
///
/// Owns its transport exclusively. Dropping a set that holds or is
/// acquiring a grant sends a best-effort release before closing.
pub struct ResourceSet<T: Transport = UnixTransport> {
    id: u32,
    application_class: String,
    resources: BTreeMap<ResourceType, Resource>,
    auto_release: bool,
    always_reply: bool,
    negotiation: Negotiation,
    transport: T,
    notify_tx: mpsc::UnboundedSender<Notification>,
    notify_rx: mpsc::UnboundedReceiver<Notification>,
    /// Locally raised events not yet yielded.
    local_events: VecDeque<ResourceEvent>,
    subscribers: Vec<mpsc::UnboundedSender<ResourceEvent>>,
}

impl ResourceSet<UnixTransport> {
    /// Set that talks to the manager socket named by the environment.
    pub fn new(application_class: impl Into<String>) -> Self {
        Self::with_transport(application_class, UnixTransport::from_env())
    }

    pub fn with_flags(
        application_class: impl Into<String>,
        auto_release: bool,
        always_reply: bool,
    ) -> Self {
        let mut set = Self::new(application_class);
        set.auto_release = auto_release;
        set.always_reply = always_reply;
        set
    }
}

impl<T: Transport> ResourceSet<T> {
    pub fn with_transport(application_class: impl Into<String>, transport: T) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            id: next_set_id(),
            application_class: application_class.into(),
            resources: BTreeMap::new(),
            auto_release: false,
            always_reply: false,
            negotiation: Negotiation::new(),
            transport,
            notify_tx,
            notify_rx,
            local_events: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }

    // -- Accessors --

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn application_class(&self) -> &str {
        &self.application_class
    }

    pub fn will_auto_release(&self) -> bool {
        self.auto_release
    }

    pub fn always_get_reply(&self) -> bool {
        self.always_reply
    }

    /// True once the manager acknowledged the handshake.
    pub fn is_connected_to_manager(&self) -> bool {
        self.negotiation.connection() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.negotiation.connection()
    }

    pub fn acquire_state(&self) -> AcquireState {
        self.negotiation.acquisition()
    }

    /// Resources the manager last confirmed as held.
    pub fn granted(&self) -> &BTreeSet<ResourceType> {
        self.negotiation.granted()
    }

    // -- Resource collection --

    /// Resources in type order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn resource(&self, kind: ResourceType) -> Option<&Resource> {
        self.resources.get(&kind)
    }

    pub fn contains(&self, kind: ResourceType) -> bool {
        self.resources.contains_key(&kind)
    }

    /// True iff every given type is in the set.
    pub fn contains_all<'a>(&self, kinds: impl IntoIterator<Item = &'a ResourceType>) -> bool {
        kinds.into_iter().all(|kind| self.contains(*kind))
    }

    /// Add a mandatory resource of `kind`, replacing any existing entry.
    pub fn add_resource(&mut self, kind: ResourceType) -> Result<(), ResourceError> {
        self.add_resource_object(Resource::new(kind))
    }

    /// Add `resource`, replacing any existing entry of its type.
    ///
    /// `None` is rejected and leaves the collection untouched.
    pub fn add_resource_object(
        &mut self,
        resource: impl Into<Option<Resource>>,
    ) -> Result<(), ResourceError> {
        let resource = resource.into().ok_or(ResourceError::MissingResource)?;
        let kind = resource.kind();
        if self.resources.insert(kind, resource).is_some() {
            tracing::debug!(set_id = self.id, %kind, "replaced resource");
        }
        Ok(())
    }

    /// Remove the resource of `kind`. Removing an absent type is a no-op.
    pub fn delete_resource(&mut self, kind: ResourceType) -> Option<Resource> {
        self.resources.remove(&kind)
    }

    /// Mutate the resource of `kind` in place. Returns `false` if absent.
    ///
    /// A change made while connected queues
    /// [`ResourceEvent::PropertiesChanged`] for the next pump; call [`update`](Self::update)
    /// to push it to the manager.
    pub fn modify_resource(&mut self, kind: ResourceType, f: impl FnOnce(&mut Resource)) -> bool {
        let Some(resource) = self.resources.get_mut(&kind) else {
            return false;
        };
        let before = resource.clone();
        f(resource);
        if *resource != before && !self.negotiation.is_disconnected() {
            self.local_events
                .push_back(ResourceEvent::PropertiesChanged(kind));
        }
        true
    }

    // -- Session flags --

    /// Ask the manager to release automatically. Only before connecting.
    pub fn set_auto_release(&mut self) -> Result<(), ResourceError> {
        if self.negotiation.flags_locked() {
            return Err(ResourceError::FlagsLocked("auto-release"));
        }
        self.auto_release = true;
        Ok(())
    }

    /// Ask the manager to answer every request. Only before connecting.
    pub fn set_always_reply(&mut self) -> Result<(), ResourceError> {
        if self.negotiation.flags_locked() {
            return Err(ResourceError::FlagsLocked("always-reply"));
        }
        self.always_reply = true;
        Ok(())
    }

    // -- Negotiation --

    /// Connect to the manager and register the set.
    ///
    /// Idempotent: on a live connection nothing is re-sent. The manager's
    /// acknowledgement arrives as [`ResourceEvent::ManagerIsUp`].
    pub fn init_and_connect(&mut self) -> Result<(), ResourceError> {
        if !self.negotiation.is_disconnected() {
            return Ok(());
        }
        let registration = Registration {
            set_id: self.id,
            application_class: self.application_class.clone(),
            auto_release: self.auto_release,
            always_reply: self.always_reply,
        };
        self.transport
            .connect(&registration, self.notify_tx.clone())?;
        self.negotiation.connecting();
        tracing::debug!(set_id = self.id, class = %self.application_class, "connecting");
        Ok(())
    }

    /// Request the resources. Connects first if needed.
    ///
    /// Returns once the request is queued; the outcome arrives as
    /// [`ResourceEvent::ResourcesGranted`] or
    /// [`ResourceEvent::ResourcesDenied`]. Acquiring while already
    /// holding or acquiring does nothing.
    pub fn acquire(&mut self) -> Result<(), ResourceError> {
        self.init_and_connect()?;
        match self.negotiation.plan_acquire() {
            Step::Send => self.send_acquire(),
            Step::Queued => {
                tracing::debug!(set_id = self.id, "acquire queued behind release");
                Ok(())
            }
            Step::Noop => Ok(()),
        }
    }

    /// Give the resources back.
    ///
    /// Without a grant or pending acquire this does nothing and no
    /// [`ResourceEvent::ResourcesReleased`] follows.
    pub fn release(&mut self) -> Result<(), ResourceError> {
        if self.negotiation.is_disconnected() {
            return Ok(());
        }
        match self.negotiation.plan_release() {
            Step::Send => {
                let request = self.transport.send_release(self.id)?;
                self.negotiation.release_sent(request);
                tracing::debug!(set_id = self.id, request, "release sent");
                Ok(())
            }
            Step::Queued | Step::Noop => Ok(()),
        }
    }

    /// Push the current resource collection to the manager without
    /// dropping a held grant. Disconnected, this is a local no-op.
    pub fn update(&mut self) -> Result<(), ResourceError> {
        if self.negotiation.is_disconnected() {
            return Ok(());
        }
        let resources: Vec<Resource> = self.resources.values().cloned().collect();
        let request = self.transport.send_update(self.id, &resources)?;
        self.negotiation.update_sent(request);
        tracing::debug!(set_id = self.id, request, "update sent");
        Ok(())
    }

    fn send_acquire(&mut self) -> Result<(), ResourceError> {
        let resources: Vec<Resource> = self.resources.values().cloned().collect();
        let request =
            self.transport
                .send_acquire(self.id, &self.application_class, &resources)?;
        self.negotiation.acquire_sent(request);
        tracing::debug!(set_id = self.id, request, count = resources.len(), "acquire sent");
        Ok(())
    }

    // -- Events --

    /// Register an additional observer. It receives every event yielded
    /// by [`next_event`](Self::next_event) or
    /// [`try_next_event`](Self::try_next_event).
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ResourceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Wait for the next event.
    ///
    /// Never resolves to `None` while the set is alive; wrap it in
    /// `tokio::time::timeout` to bound the wait.
    pub async fn next_event(&mut self) -> Option<ResourceEvent> {
        if let Some(event) = self.next_local_event() {
            return Some(event);
        }
        loop {
            let notification = self.notify_rx.recv().await?;
            if let Some(event) = self.handle_notification(notification) {
                return Some(event);
            }
        }
    }

    /// Process already-delivered notifications until one yields an event.
    pub fn try_next_event(&mut self) -> Option<ResourceEvent> {
        if let Some(event) = self.next_local_event() {
            return Some(event);
        }
        while let Ok(notification) = self.notify_rx.try_recv() {
            if let Some(event) = self.handle_notification(notification) {
                return Some(event);
            }
        }
        None
    }

    fn handle_notification(&mut self, notification: Notification) -> Option<ResourceEvent> {
        tracing::trace!(set_id = self.id, ?notification, "notification");
        let Dispatch { event, follow_up } =
            dispatcher::dispatch(&mut self.negotiation, notification, self.auto_release);

        if let Some(FollowUp::Acquire) = follow_up {
            if let Err(e) = self.send_acquire() {
                tracing::warn!(set_id = self.id, error = %e, "queued acquire failed");
                self.local_events.push_back(ResourceEvent::Error {
                    code: SEND_FAILED,
                    message: e.to_string(),
                });
            }
        }

        match event {
            Some(event) => {
                self.emit(event.clone());
                Some(event)
            }
            None => self.next_local_event(),
        }
    }

    fn next_local_event(&mut self) -> Option<ResourceEvent> {
        let event = self.local_events.pop_front()?;
        self.emit(event.clone());
        Some(event)
    }

    fn emit(&mut self, event: ResourceEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<T: Transport> Drop for ResourceSet<T> {
    fn drop(&mut self) {
        if self.negotiation.is_disconnected() {
            return;
        }
        if matches!(
            self.negotiation.acquisition(),
            AcquireState::Held | AcquireState::AcquirePending
        ) {
            if let Err(e) = self.transport.send_release(self.id) {
                tracing::debug!(set_id = self.id, error = %e, "release on drop failed");
            }
        }
        self.transport.disconnect();
    }
}

impl<T: Transport> std::fmt::Debug for ResourceSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSet")
            .field("id", &self.id)
            .field("application_class", &self.application_class)
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("connection", &self.negotiation.connection())
            .field("acquisition", &self.negotiation.acquisition())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::transport::{NotificationSender, RequestId};

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Connect(Registration),
        Acquire(RequestId, Vec<ResourceType>),
        Release(RequestId),
        Update(RequestId, Vec<Resource>),
        Disconnect,
    }

    #[derive(Default)]
    struct Inner {
        sent: Vec<Sent>,
        notify: Option<NotificationSender>,
        next_id: RequestId,
        refuse: bool,
    }

    /// In-memory transport: records requests, lets the test play the
    /// manager by pushing notifications.
    #[derive(Clone, Default)]
    struct Scripted(Rc<RefCell<Inner>>);

    impl Scripted {
        fn refusing() -> Self {
            let t = Self::default();
            t.0.borrow_mut().refuse = true;
            t
        }

        fn push(&self, n: Notification) {
            let inner = self.0.borrow();
            inner.notify.as_ref().unwrap().send(n).unwrap();
        }

        fn sent(&self) -> Vec<Sent> {
            self.0.borrow().sent.clone()
        }

        fn last_id(&self) -> RequestId {
            self.0.borrow().next_id
        }

        fn record(&self, build: impl FnOnce(RequestId) -> Sent) -> Result<RequestId, TransportError> {
            let mut inner = self.0.borrow_mut();
            if inner.notify.is_none() {
                return Err(TransportError::NotConnected);
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.sent.push(build(id));
            Ok(id)
        }
    }

    impl Transport for Scripted {
        fn connect(
            &mut self,
            registration: &Registration,
            notifications: NotificationSender,
        ) -> Result<(), TransportError> {
            let mut inner = self.0.borrow_mut();
            if inner.refuse {
                return Err(TransportError::Closed);
            }
            if inner.notify.is_none() {
                inner.sent.push(Sent::Connect(registration.clone()));
                inner.notify = Some(notifications);
            }
            Ok(())
        }

        fn send_acquire(
            &mut self,
            _set_id: u32,
            _application_class: &str,
            resources: &[Resource],
        ) -> Result<RequestId, TransportError> {
            let kinds = resources.iter().map(Resource::kind).collect();
            self.record(|id| Sent::Acquire(id, kinds))
        }

        fn send_release(&mut self, _set_id: u32) -> Result<RequestId, TransportError> {
            self.record(Sent::Release)
        }

        fn send_update(
            &mut self,
            _set_id: u32,
            resources: &[Resource],
        ) -> Result<RequestId, TransportError> {
            let resources = resources.to_vec();
            self.record(|id| Sent::Update(id, resources))
        }

        fn disconnect(&mut self) {
            let mut inner = self.0.borrow_mut();
            if inner.notify.take().is_some() {
                inner.sent.push(Sent::Disconnect);
            }
        }
    }

    fn player() -> (ResourceSet<Scripted>, Scripted) {
        let transport = Scripted::default();
        let mut set = ResourceSet::with_transport("player", transport.clone());
        set.add_resource(ResourceType::AudioPlayback).unwrap();
        (set, transport)
    }

    fn grant(kinds: &[ResourceType]) -> Notification {
        Notification::Granted(kinds.iter().copied().collect())
    }

    /// Drain every pending event.
    fn events(set: &mut ResourceSet<Scripted>) -> Vec<ResourceEvent> {
        std::iter::from_fn(|| set.try_next_event()).collect()
    }

    fn held_player() -> (ResourceSet<Scripted>, Scripted) {
        let (mut set, t) = player();
        set.acquire().unwrap();
        t.push(Notification::ManagerUp);
        t.push(grant(&[ResourceType::AudioPlayback]));
        events(&mut set);
        (set, t)
    }

    // -- Resource collection --

    #[test]
    fn new_set_is_empty() {
        let set = ResourceSet::with_transport("player", Scripted::default());
        assert!(set.resources().next().is_none());
        assert!(ResourceType::ALL.iter().all(|kind| !set.contains(*kind)));
        assert!(set.contains_all(&[]));
        assert_eq!(set.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn delete_keeps_other_types() {
        let mut set = ResourceSet::with_transport("player", Scripted::default());
        for kind in ResourceType::ALL {
            set.add_resource(kind).unwrap();
        }
        set.delete_resource(ResourceType::Leds);
        for kind in ResourceType::ALL {
            assert_eq!(set.contains(kind), kind != ResourceType::Leds);
        }
    }

    #[test]
    fn add_replaces_existing_type() {
        let (mut set, _) = player();
        set.add_resource_object(Resource::audio_playback("player"))
            .unwrap();
        set.add_resource(ResourceType::Vibra).unwrap();

        assert_eq!(set.resources().count(), 2);
        let audio = set.resource(ResourceType::AudioPlayback).unwrap();
        assert_eq!(audio.audio().unwrap().audio_group(), Some("player"));
        assert!(set.contains_all(&[ResourceType::AudioPlayback, ResourceType::Vibra]));
        assert!(!set.contains_all(&[ResourceType::AudioPlayback, ResourceType::Leds]));
    }

    #[test]
    fn add_missing_resource_is_rejected() {
        let (mut set, _) = player();
        let err = set.add_resource_object(None::<Resource>).unwrap_err();
        assert!(matches!(err, ResourceError::MissingResource));
        assert_eq!(set.resources().count(), 1);
    }

    #[test]
    fn delete_absent_type_is_noop() {
        let (mut set, _) = player();
        assert!(set.delete_resource(ResourceType::Leds).is_none());
        assert!(set.delete_resource(ResourceType::AudioPlayback).is_some());
        assert!(set.resources().next().is_none());
    }

    #[test]
    fn resources_iterate_in_type_order() {
        let (mut set, _) = player();
        set.add_resource(ResourceType::Leds).unwrap();
        set.add_resource(ResourceType::VideoPlayback).unwrap();
        let kinds: Vec<_> = set.resources().map(Resource::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceType::AudioPlayback,
                ResourceType::VideoPlayback,
                ResourceType::Leds,
            ]
        );
    }

    #[test]
    fn sets_get_distinct_ids() {
        let a = ResourceSet::with_transport("player", Scripted::default());
        let b = ResourceSet::with_transport("game", Scripted::default());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.application_class(), "player");
        assert_eq!(b.application_class(), "game");
    }

    // -- Session flags --

    #[test]
    fn flags_lock_after_connect() {
        let (mut set, t) = player();
        set.set_auto_release().unwrap();
        set.init_and_connect().unwrap();
        assert!(matches!(
            set.set_always_reply(),
            Err(ResourceError::FlagsLocked(_))
        ));
        assert!(set.will_auto_release());
        assert!(!set.always_get_reply());

        match &t.sent()[0] {
            Sent::Connect(reg) => {
                assert!(reg.auto_release);
                assert!(!reg.always_reply);
                assert_eq!(reg.application_class, "player");
            }
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn failed_connect_leaves_flags_open() {
        let mut set = ResourceSet::with_transport("player", Scripted::refusing());
        assert!(matches!(
            set.init_and_connect(),
            Err(ResourceError::Transport(_))
        ));
        assert_eq!(set.connection_state(), ConnectionState::Disconnected);
        assert!(set.set_always_reply().is_ok());
    }

    // -- Negotiation --

    #[test]
    fn init_and_connect_is_idempotent() {
        let (mut set, t) = player();
        set.init_and_connect().unwrap();
        set.init_and_connect().unwrap();
        assert_eq!(t.sent().len(), 1);
        assert_eq!(set.connection_state(), ConnectionState::Connecting);
        assert!(!set.is_connected_to_manager());

        t.push(Notification::ManagerUp);
        assert_eq!(events(&mut set), vec![ResourceEvent::ManagerIsUp]);
        assert!(set.is_connected_to_manager());
    }

    #[test]
    fn acquire_connects_implicitly() {
        let (mut set, t) = player();
        set.acquire().unwrap();
        let sent = t.sent();
        assert!(matches!(sent[0], Sent::Connect(_)));
        assert_eq!(sent[1], Sent::Acquire(1, vec![ResourceType::AudioPlayback]));
        assert_eq!(set.acquire_state(), AcquireState::AcquirePending);
    }

    #[test]
    fn double_acquire_yields_one_grant() {
        let (mut set, t) = player();
        set.acquire().unwrap();
        set.acquire().unwrap();
        t.push(Notification::ManagerUp);
        t.push(grant(&[ResourceType::AudioPlayback]));
        t.push(grant(&[ResourceType::AudioPlayback]));

        let acquires = t
            .sent()
            .iter()
            .filter(|s| matches!(s, Sent::Acquire(..)))
            .count();
        assert_eq!(acquires, 1);
        assert_eq!(
            events(&mut set),
            vec![
                ResourceEvent::ManagerIsUp,
                ResourceEvent::ResourcesGranted([ResourceType::AudioPlayback].into()),
            ]
        );
        assert_eq!(set.acquire_state(), AcquireState::Held);
        assert!(set.granted().contains(&ResourceType::AudioPlayback));
    }

    #[test]
    fn release_without_grant_is_silent() {
        let (mut set, t) = player();
        set.release().unwrap();
        assert!(t.sent().is_empty());

        set.init_and_connect().unwrap();
        t.push(Notification::ManagerUp);
        set.release().unwrap();
        assert_eq!(t.sent().len(), 1);
        assert_eq!(events(&mut set), vec![ResourceEvent::ManagerIsUp]);
    }

    #[test]
    fn release_after_grant_reports_released() {
        let (mut set, t) = held_player();
        set.release().unwrap();
        assert_eq!(t.sent().last(), Some(&Sent::Release(2)));

        t.push(Notification::Released);
        assert_eq!(events(&mut set), vec![ResourceEvent::ResourcesReleased]);
        assert_eq!(set.acquire_state(), AcquireState::Idle);
        assert!(set.granted().is_empty());
    }

    #[test]
    fn double_release_reports_once() {
        let (mut set, t) = held_player();
        set.release().unwrap();
        set.release().unwrap();
        let releases = t
            .sent()
            .iter()
            .filter(|s| matches!(s, Sent::Release(_)))
            .count();
        assert_eq!(releases, 1);

        t.push(Notification::Released);
        t.push(Notification::Released);
        assert_eq!(events(&mut set), vec![ResourceEvent::ResourcesReleased]);
    }

    #[test]
    fn acquire_during_release_is_sent_after_confirmation() {
        let (mut set, t) = held_player();
        set.release().unwrap();
        set.acquire().unwrap();
        assert_eq!(t.sent().last(), Some(&Sent::Release(2)));

        t.push(Notification::Released);
        assert_eq!(events(&mut set), vec![ResourceEvent::ResourcesReleased]);
        assert_eq!(
            t.sent().last(),
            Some(&Sent::Acquire(3, vec![ResourceType::AudioPlayback]))
        );
        assert_eq!(set.acquire_state(), AcquireState::AcquirePending);
    }

    #[test]
    fn release_while_acquiring_absorbs_late_grant() {
        let (mut set, t) = player();
        set.acquire().unwrap();
        set.release().unwrap();
        t.push(grant(&[ResourceType::AudioPlayback]));
        t.push(Notification::Released);
        assert!(events(&mut set).is_empty());
        assert_eq!(set.acquire_state(), AcquireState::Idle);
    }

    #[test]
    fn update_while_disconnected_is_local() {
        let (mut set, t) = player();
        set.update().unwrap();
        assert!(t.sent().is_empty());
        assert!(events(&mut set).is_empty());
    }

    #[test]
    fn update_keeps_grant_and_reports_ok() {
        let (mut set, t) = held_player();
        set.add_resource(ResourceType::Vibra).unwrap();
        set.update().unwrap();

        let id = t.last_id();
        match t.sent().last() {
            Some(Sent::Update(_, resources)) => assert_eq!(resources.len(), 2),
            other => panic!("expected Update, got {other:?}"),
        }
        t.push(Notification::UpdateOk { request: id });
        assert_eq!(events(&mut set), vec![ResourceEvent::UpdateOk]);
        assert_eq!(set.acquire_state(), AcquireState::Held);
    }

    #[test]
    fn error_for_acquire_rolls_back() {
        let (mut set, t) = player();
        set.acquire().unwrap();
        t.push(Notification::Error {
            request: t.last_id(),
            code: 1,
            message: "unknown resource type".into(),
        });
        assert_eq!(
            events(&mut set),
            vec![ResourceEvent::Error {
                code: 1,
                message: "unknown resource type".into(),
            }]
        );
        assert_eq!(set.acquire_state(), AcquireState::Idle);
    }

    #[test]
    fn queued_acquire_send_failure_is_reported() {
        let (mut set, t) = held_player();
        set.release().unwrap();
        set.acquire().unwrap();
        t.push(Notification::Released);
        // Requests fail from here on; the notification is already queued.
        t.0.borrow_mut().notify = None;

        let got = events(&mut set);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], ResourceEvent::ResourcesReleased);
        assert!(matches!(
            got[1],
            ResourceEvent::Error { code: SEND_FAILED, .. }
        ));
        assert_eq!(set.acquire_state(), AcquireState::Idle);
    }

    #[test]
    fn send_failure_after_silent_release_is_reported_at_once() {
        let (mut set, t) = player();
        set.acquire().unwrap();
        set.release().unwrap();
        set.acquire().unwrap();
        t.push(Notification::Released);
        t.0.borrow_mut().notify = None;

        assert!(matches!(
            set.try_next_event(),
            Some(ResourceEvent::Error { code: SEND_FAILED, .. })
        ));
        assert_eq!(set.try_next_event(), None);
    }

    #[test]
    fn connection_loss_while_acquiring_reports_denial() {
        let (mut set, t) = player();
        set.acquire().unwrap();
        t.push(Notification::ManagerUp);
        t.push(Notification::Disconnected);
        assert_eq!(
            events(&mut set),
            vec![ResourceEvent::ManagerIsUp, ResourceEvent::ResourcesDenied]
        );
        assert_eq!(set.acquire_state(), AcquireState::Idle);
    }

    #[test]
    fn connection_loss_while_releasing_reports_released() {
        let (mut set, t) = held_player();
        set.release().unwrap();
        t.push(Notification::Disconnected);
        assert_eq!(events(&mut set), vec![ResourceEvent::ResourcesReleased]);
        assert_eq!(set.acquire_state(), AcquireState::Idle);
        assert_eq!(set.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_loss_while_held_reports_lost() {
        let (mut set, t) = held_player();
        t.push(Notification::Disconnected);
        assert_eq!(events(&mut set), vec![ResourceEvent::LostResources]);
        assert_eq!(set.connection_state(), ConnectionState::Disconnected);
        assert!(set.granted().is_empty());
    }

    // -- Events --

    #[test]
    fn subscribers_see_every_event() {
        let (mut set, t) = player();
        let mut rx = set.subscribe();
        let dropped = set.subscribe();
        drop(dropped);

        set.acquire().unwrap();
        t.push(Notification::ManagerUp);
        t.push(Notification::Denied);
        events(&mut set);

        assert_eq!(rx.try_recv().unwrap(), ResourceEvent::ManagerIsUp);
        assert_eq!(rx.try_recv().unwrap(), ResourceEvent::ResourcesDenied);
        assert!(rx.try_recv().is_err());
        assert_eq!(set.subscribers.len(), 1);
    }

    #[test]
    fn modify_reports_changes_only_when_connected() {
        let (mut set, t) = player();
        assert!(set.modify_resource(ResourceType::AudioPlayback, |r| r.set_optional(true)));
        assert!(events(&mut set).is_empty());
        assert!(!set.modify_resource(ResourceType::Leds, |_| {}));

        set.init_and_connect().unwrap();
        t.push(Notification::ManagerUp);
        let mut rx = set.subscribe();
        set.modify_resource(ResourceType::AudioPlayback, |r| {
            if let Some(audio) = r.audio_mut() {
                audio.set_audio_group("game");
            }
        });
        // Local events come before already-delivered notifications.
        assert_eq!(
            events(&mut set),
            vec![
                ResourceEvent::PropertiesChanged(ResourceType::AudioPlayback),
                ResourceEvent::ManagerIsUp,
            ]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ResourceEvent::PropertiesChanged(ResourceType::AudioPlayback)
        );
        assert_eq!(rx.try_recv().unwrap(), ResourceEvent::ManagerIsUp);

        // Unchanged value, no event.
        set.modify_resource(ResourceType::AudioPlayback, |r| r.set_optional(true));
        assert!(events(&mut set).is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn next_event_yields_property_change() {
        let (mut set, _t) = player();
        set.init_and_connect().unwrap();
        set.modify_resource(ResourceType::AudioPlayback, |r| r.set_optional(true));
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), set.next_event())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(ResourceEvent::PropertiesChanged(ResourceType::AudioPlayback))
        );
    }

    #[tokio::test]
    async fn next_event_waits_for_notification() {
        let (mut set, t) = player();
        set.init_and_connect().unwrap();
        let sender = t.0.borrow().notify.clone().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            sender.send(Notification::ManagerUp).unwrap();
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), set.next_event())
            .await
            .unwrap();
        assert_eq!(event, Some(ResourceEvent::ManagerIsUp));
    }

    // -- Drop --

    #[test]
    fn drop_releases_held_grant() {
        let (set, t) = held_player();
        drop(set);
        let sent = t.sent();
        let tail = &sent[sent.len() - 2..];
        assert_eq!(tail, &[Sent::Release(2), Sent::Disconnect]);
    }

    #[test]
    fn drop_while_idle_only_disconnects() {
        let (mut set, t) = player();
        set.init_and_connect().unwrap();
        drop(set);
        assert_eq!(t.sent().last(), Some(&Sent::Disconnect));
        assert_eq!(t.sent().len(), 2);
    }
}
