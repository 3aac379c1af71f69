//! Manager state: registered sets and their grants.
//!
//! All methods are pure state transitions with no I/O. Error strings
//! are the human-readable part of an `error` frame; the handler pairs
//! them with a code.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ManagerConfig;
use crate::ipc::protocol::ResourceDescriptor;
use crate::resource::ResourceType;

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Registration of one resource set. One per connection.
#[derive(Debug)]
struct SetEntry {
    set_id: u32,
    application_class: String,
    /// `None` while not granted.
    held: Option<BTreeSet<ResourceType>>,
}

/// Effect of an update on a set's grant.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Unchanged,
    /// The held grant changed to this.
    Regranted(BTreeSet<ResourceType>),
    /// The new request can no longer be granted.
    Lost,
}

/// Registered sets keyed by owning connection.
///
/// Owned exclusively by the manager loop.
#[derive(Debug)]
pub struct ManagerState {
    deny: BTreeSet<ResourceType>,
    sets: HashMap<ConnectionId, SetEntry>,
}

impl ManagerState {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            deny: config.deny,
            sets: HashMap::new(),
        }
    }

    pub fn is_registered(&self, conn: ConnectionId) -> bool {
        self.sets.contains_key(&conn)
    }

    pub fn register(
        &mut self,
        conn: ConnectionId,
        set_id: u32,
        application_class: String,
    ) -> Result<(), &'static str> {
        if self.sets.contains_key(&conn) {
            return Err("connection already registered a set");
        }
        tracing::debug!(?conn, set_id, class = %application_class, "set registered");
        self.sets.insert(
            conn,
            SetEntry {
                set_id,
                application_class,
                held: None,
            },
        );
        Ok(())
    }

    /// Drop a connection's registration. Its grant, if any, is released
    /// implicitly. Returns the set id that was registered.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> Option<u32> {
        self.sets.remove(&conn).map(|entry| entry.set_id)
    }

    /// Grant for `resources`: every type not on the deny list, or
    /// `None` when a mandatory type is denied or nothing is left.
    pub fn compute_grant(&self, resources: &[ResourceDescriptor]) -> Option<BTreeSet<ResourceType>> {
        if resources
            .iter()
            .any(|r| !r.optional && self.deny.contains(&r.kind))
        {
            return None;
        }
        let grant: BTreeSet<_> = resources
            .iter()
            .map(|r| r.kind)
            .filter(|kind| !self.deny.contains(kind))
            .collect();
        (!grant.is_empty()).then_some(grant)
    }

    pub fn acquire(
        &mut self,
        conn: ConnectionId,
        set_id: u32,
        resources: &[ResourceDescriptor],
    ) -> Result<Option<BTreeSet<ResourceType>>, &'static str> {
        let grant = self.compute_grant(resources);
        let entry = self.entry_mut(conn, set_id)?;
        entry.held = grant.clone();
        Ok(grant)
    }

    pub fn release(&mut self, conn: ConnectionId, set_id: u32) -> Result<(), &'static str> {
        let entry = self.entry_mut(conn, set_id)?;
        entry.held = None;
        Ok(())
    }

    pub fn update(
        &mut self,
        conn: ConnectionId,
        set_id: u32,
        resources: &[ResourceDescriptor],
    ) -> Result<UpdateOutcome, &'static str> {
        let grant = self.compute_grant(resources);
        let entry = self.entry_mut(conn, set_id)?;
        let Some(held) = entry.held.as_ref() else {
            return Ok(UpdateOutcome::Unchanged);
        };
        let outcome = match grant {
            Some(grant) if grant == *held => UpdateOutcome::Unchanged,
            Some(grant) => {
                entry.held = Some(grant.clone());
                UpdateOutcome::Regranted(grant)
            }
            None => {
                entry.held = None;
                UpdateOutcome::Lost
            }
        };
        Ok(outcome)
    }

    /// Force-release every grant. Returns `(connection, set_id)` of
    /// each former holder.
    pub fn release_all(&mut self) -> Vec<(ConnectionId, u32)> {
        self.sets
            .iter_mut()
            .filter_map(|(conn, entry)| {
                entry.held.take()?;
                tracing::debug!(set_id = entry.set_id, class = %entry.application_class, "grant revoked");
                Some((*conn, entry.set_id))
            })
            .collect()
    }

    fn entry_mut(&mut self, conn: ConnectionId, set_id: u32) -> Result<&mut SetEntry, &'static str> {
        self.sets
            .get_mut(&conn)
            .filter(|entry| entry.set_id == set_id)
            .ok_or("set not registered on this connection")
    }
}
