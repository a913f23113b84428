//! Table of live connection records keyed by transport handle.

use std::collections::HashMap;
use std::time::Instant;

use crate::auth::{AuthState, ConnectionRecord};
use crate::identity::{ConnectionHandle, Identity};

/// Errors from registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A record already exists for this handle.
    #[error("connection {0} is already registered")]
    DuplicateHandle(ConnectionHandle),
}

/// Map of active connections.
///
/// Not synchronized; the owner wraps it in a lock so that the event and poll
/// contexts never observe it half-updated.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: HashMap<ConnectionHandle, ConnectionRecord>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `Pending` record. Fails if the handle is already present.
    pub fn create(
        &mut self,
        handle: ConnectionHandle,
        identity: Identity,
        now: Instant,
    ) -> Result<&mut ConnectionRecord, RegistryError> {
        use std::collections::hash_map::Entry;

        match self.records.entry(handle) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateHandle(handle)),
            Entry::Vacant(slot) => Ok(slot.insert(ConnectionRecord::new(handle, identity, now))),
        }
    }

    /// Look up a record.
    pub fn get(&self, handle: ConnectionHandle) -> Option<&ConnectionRecord> {
        self.records.get(&handle)
    }

    /// Look up a record for mutation.
    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&handle)
    }

    /// Remove and return a record.
    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<ConnectionRecord> {
        self.records.remove(&handle)
    }

    /// Visit every record.
    pub fn for_each(&self, visit: impl FnMut(&ConnectionRecord)) {
        self.records.values().for_each(visit);
    }

    /// Find the lowest handle whose record has `identity` and is in `state`.
    ///
    /// The lowest handle is the oldest connection, which keeps the choice
    /// deterministic when an identity connects twice.
    pub fn find_by_identity(
        &self,
        identity: Identity,
        state: AuthState,
    ) -> Option<ConnectionHandle> {
        self.records
            .values()
            .filter(|record| record.identity() == identity && record.state() == state)
            .map(ConnectionRecord::handle)
            .min()
    }

    /// Handles of every record matching `predicate`.
    pub fn handles_where(
        &self,
        mut predicate: impl FnMut(&ConnectionRecord) -> bool,
    ) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self
            .records
            .values()
            .filter(|record| predicate(record))
            .map(ConnectionRecord::handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Remove every record.
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self.records.drain().map(|(_, record)| record).collect();
        records.sort_unstable_by_key(ConnectionRecord::handle);
        records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
