//! Replicators and their registry
//!
//! ## Design
//!
//! A replicator owns the replication behavior of one namespace: it turns
//! incoming events into table writes, supplies the filter that compacts
//! events for its records, and dumps every live record for bootstrap.
//!
//! Local mutations reach the engine through hooks. A replicated table gets
//! a set hook and a delete hook that look for `PendingEvents` on the
//! transaction (see `WriteTx::extension_mut`). Transactions opened by a
//! `ReplicatedStore` carry them; plain store transactions do not, so writes
//! made while applying remote events never echo back as new events.
//!
//! ## Conflict policy
//!
//! `ReplicatorOptions` makes every policy pluggable:
//! - `extract`: projection of a record that is serialized into events
//! - `merge`: combine an incoming record that strictly follows the local one
//! - `on_conflict`: pick the record to keep when the two are concurrent
//!
//! The default conflict policy keeps the record with the later
//! `updated_at`, breaking ties by the larger encoding, and gives the winner
//! the pointwise maximum of both versions. Both replicas of a conflict run
//! the same comparison and settle on the same bytes.

use std::any::type_name;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tessera_core::{encode, Error, Namespace, Replicated, Result};
use tessera_storage::{ReadTx, WriteTx};
use tracing::debug;

use crate::event::Event;
use crate::filter::EventFilter;

/// Replication behavior of one namespace
pub trait Replicator: Send + Sync {
    /// Namespace the replicator handles
    fn namespace(&self) -> Namespace;

    /// Fresh filter for this namespace's events
    fn event_filter(&self) -> Box<dyn EventFilter>;

    /// Apply a remote event to local state
    fn apply_event(&self, tx: &mut dyn WriteTx, event: &Event) -> Result<()>;

    /// Every live record as a write event
    fn dump(&self, tx: &dyn ReadTx) -> Result<Vec<Event>>;
}

/// Replicators by namespace
///
/// Cloning shares the registry.
#[derive(Clone, Default)]
pub struct ReplicationRegistry {
    replicators: Arc<RwLock<BTreeMap<Namespace, Arc<dyn Replicator>>>>,
}

impl std::fmt::Debug for ReplicationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationRegistry")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

impl ReplicationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `replicator`, replacing any previous one for its namespace
    pub fn register(&self, replicator: Arc<dyn Replicator>) {
        let ns = replicator.namespace();
        debug!(target: "tessera::replication", ns = %ns, "replicator registered");
        self.replicators.write().insert(ns, replicator);
    }

    /// Replicator of `ns`
    ///
    /// # Errors
    ///
    /// `ReplicatorNotFound` when nothing is registered for `ns`.
    pub fn get(&self, ns: Namespace) -> Result<Arc<dyn Replicator>> {
        self.replicators
            .read()
            .get(&ns)
            .cloned()
            .ok_or(Error::ReplicatorNotFound(ns))
    }

    /// True when `ns` has a replicator
    pub fn contains(&self, ns: Namespace) -> bool {
        self.replicators.read().contains_key(&ns)
    }

    /// Registered namespaces in order
    pub fn namespaces(&self) -> Vec<Namespace> {
        self.replicators.read().keys().copied().collect()
    }

    /// Every replicator in namespace order
    pub fn all(&self) -> Vec<Arc<dyn Replicator>> {
        self.replicators.read().values().cloned().collect()
    }
}

/// Events produced by one replicated transaction
#[derive(Debug)]
pub struct PendingEvents {
    replica_id: u64,
    events: Vec<Event>,
}

impl PendingEvents {
    /// Empty list for a transaction on `replica_id`
    pub fn new(replica_id: u64) -> Self {
        Self {
            replica_id,
            events: Vec::new(),
        }
    }

    /// Local replica id
    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    /// Append an event
    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Remove and return every recorded event
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

/// Pending events of a replicated transaction, `None` for plain ones
pub fn pending_events(tx: &mut dyn WriteTx) -> Option<&mut PendingEvents> {
    tx.extension_mut()?.downcast_mut::<PendingEvents>()
}

/// Projection `(tx, record, previous)` serialized into events
pub type ExtractFn<T> = Arc<dyn Fn(&dyn ReadTx, &T, Option<&T>) -> T + Send + Sync>;

/// Merge `(tx, incoming, local)` of an incoming record that follows the local one
pub type MergeFn<T> = Arc<dyn Fn(&mut dyn WriteTx, T, &T) -> T + Send + Sync>;

/// Resolution `(tx, incoming, local)` of concurrent records; returns the record to store
pub type ConflictFn<T> = Arc<dyn Fn(&mut dyn WriteTx, T, T) -> Result<T> + Send + Sync>;

/// Pluggable replication policies
pub struct ReplicatorOptions<T> {
    /// Projection serialized into events; the whole record when unset
    pub extract: Option<ExtractFn<T>>,
    /// Merge policy; incoming record with merged version when unset
    pub merge: Option<MergeFn<T>>,
    /// Conflict policy; later `updated_at` wins when unset
    pub on_conflict: Option<ConflictFn<T>>,
}

impl<T> Clone for ReplicatorOptions<T> {
    fn clone(&self) -> Self {
        Self {
            extract: self.extract.clone(),
            merge: self.merge.clone(),
            on_conflict: self.on_conflict.clone(),
        }
    }
}

impl<T> Default for ReplicatorOptions<T> {
    fn default() -> Self {
        Self {
            extract: None,
            merge: None,
            on_conflict: None,
        }
    }
}

impl<T: Replicated> ReplicatorOptions<T> {
    /// Serialize `f(tx, record, previous)` instead of the record
    pub fn extract(
        mut self,
        f: impl Fn(&dyn ReadTx, &T, Option<&T>) -> T + Send + Sync + 'static,
    ) -> Self {
        self.extract = Some(Arc::new(f));
        self
    }

    /// Merge incoming records with `f(tx, incoming, local)`
    pub fn merge(mut self, f: impl Fn(&mut dyn WriteTx, T, &T) -> T + Send + Sync + 'static) -> Self {
        self.merge = Some(Arc::new(f));
        self
    }

    /// Resolve conflicts with `f(tx, incoming, local)`
    pub fn on_conflict(
        mut self,
        f: impl Fn(&mut dyn WriteTx, T, T) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.on_conflict = Some(Arc::new(f));
        self
    }

    pub(crate) fn project(&self, tx: &dyn ReadTx, record: &T, prev: Option<&T>) -> Result<Vec<u8>> {
        match &self.extract {
            Some(f) => encode(&f(tx, record, prev)),
            None => encode(record),
        }
    }

    pub(crate) fn apply_merge(&self, tx: &mut dyn WriteTx, incoming: T, local: &T) -> T {
        match &self.merge {
            Some(f) => f(tx, incoming, local),
            None => default_merge(incoming, local),
        }
    }

    pub(crate) fn resolve(&self, tx: &mut dyn WriteTx, incoming: T, local: T) -> Result<T> {
        match &self.on_conflict {
            Some(f) => f(tx, incoming, local),
            None => default_on_conflict(incoming, local),
        }
    }
}

/// Keep `incoming`, folding the local version into it
pub fn default_merge<T: Replicated>(mut incoming: T, local: &T) -> T {
    incoming.version_mut().update(local.version());
    incoming
}

/// Keep the record with the later `updated_at`
///
/// Ties go to the record with the larger encoding. The winner carries the
/// pointwise maximum of both versions.
pub fn default_on_conflict<T: Replicated>(incoming: T, local: T) -> Result<T> {
    let order = match incoming
        .version()
        .updated_at()
        .cmp(&local.version().updated_at())
    {
        Ordering::Equal => encode(&incoming)?.cmp(&encode(&local)?),
        o => o,
    };
    let (mut winner, loser) = match order {
        Ordering::Less => (local, incoming),
        _ => (incoming, local),
    };
    winner.version_mut().update(loser.version());
    debug!(
        target: "tessera::replication",
        record_type = type_name::<T>(),
        updated_at = winner.version().updated_at(),
        "conflict resolved"
    );
    Ok(winner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tessera_core::VersionVector;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Note {
        body: String,
        version: VersionVector,
    }

    impl Replicated for Note {
        fn version(&self) -> &VersionVector {
            &self.version
        }
        fn version_mut(&mut self) -> &mut VersionVector {
            &mut self.version
        }
    }

    fn note(body: &str, entries: &[(u64, u64)], updated_at: i64) -> Note {
        let mut version = VersionVector::from_entries(entries.iter().copied());
        version.set_updated_at(updated_at);
        Note {
            body: body.into(),
            version,
        }
    }

    #[test]
    fn test_later_update_wins() {
        let a = note("a", &[(1, 1)], 10);
        let b = note("b", &[(2, 1)], 20);
        let w = default_on_conflict(a.clone(), b.clone()).unwrap();
        assert_eq!(w.body, "b");
        assert_eq!(w.version.get(1), 1);
        assert_eq!(w.version.get(2), 1);
        assert_eq!(default_on_conflict(b, a).unwrap(), w);
    }

    #[test]
    fn test_tie_is_symmetric() {
        let a = note("a", &[(1, 1)], 10);
        let b = note("b", &[(2, 1)], 10);
        let ab = default_on_conflict(a.clone(), b.clone()).unwrap();
        let ba = default_on_conflict(b, a).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_default_merge_keeps_incoming_payload() {
        let local = note("old", &[(1, 3), (2, 1)], 5);
        let incoming = note("new", &[(2, 2)], 6);
        let m = default_merge(incoming, &local);
        assert_eq!(m.body, "new");
        assert_eq!(m.version.get(1), 3);
        assert_eq!(m.version.get(2), 2);
    }

    #[test]
    fn test_pending_events_take() {
        let mut p = PendingEvents::new(7);
        assert!(p.is_empty());
        p.push(Event::delete(Namespace::new(20), 1, VersionVector::new()));
        assert_eq!(p.replica_id(), 7);
        assert_eq!(p.take().len(), 1);
        assert!(p.is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let r = ReplicationRegistry::new();
        assert!(matches!(
            r.get(Namespace::new(99)),
            Err(Error::ReplicatorNotFound(_))
        ));
        assert!(r.namespaces().is_empty());
    }
}
