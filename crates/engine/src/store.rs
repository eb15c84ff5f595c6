//! Replicated store
//!
//! `ReplicatedStore` wraps a backing store and records every replicated
//! mutation made through it.
//!
//! ## Design
//!
//! `update` hands the caller a `ReplicatedTx`, which forwards reads and
//! writes to the backing transaction and carries the `PendingEvents` that
//! replicator hooks append to. If the closure produced any events, the same
//! backing transaction also:
//!
//! 1. allocates the next log id from the shared id counter
//! 2. increments this replica's checkpoint
//! 3. persists the log (without payloads)
//!
//! Once the backing transaction commits, the full log is broadcast to
//! subscribers. A failed closure leaves nothing behind and broadcasts
//! nothing.
//!
//! Remote events are applied through plain backing transactions, so the
//! replicator hooks stay silent and applied changes never echo back out as
//! new local logs.

use std::any::Any;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_core::{reserved, Error, Result, VersionVector};
use tessera_primitives::{IdCounter, Singleton};
use tessera_storage::{ReadTx, Store, WriteTx};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoints;
use crate::event::{max_version, min_version, Checkpoint, Event, EventLog};
use crate::filter::{DeleteFilter, EventFilter, ReplicationFilter};
use crate::log_store::EventLogStore;
use crate::replicator::{PendingEvents, ReplicationRegistry};

/// Schema version of the replicated data layout
///
/// Peers refuse to replicate with a store persisted under another version.
pub const STORE_VERSION: u32 = 1;

const NOTIFY_CAPACITY: usize = 256;

/// Persisted schema version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVersion {
    /// Version the store was initialized with
    pub version: u32,
}

/// Transaction handle of a `ReplicatedStore`
pub struct ReplicatedTx<'a, 'b> {
    inner: &'a mut (dyn WriteTx + 'b),
    pending: PendingEvents,
}

impl ReadTx for ReplicatedTx<'_, '_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        self.inner.scan_prefix(prefix)
    }

    fn salt(&self) -> Option<&[u8]> {
        self.inner.salt()
    }
}

impl WriteTx for ReplicatedTx<'_, '_> {
    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.put(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn as_read(&self) -> &dyn ReadTx {
        self
    }

    fn extension_mut(&mut self) -> Option<&mut dyn Any> {
        Some(&mut self.pending)
    }
}

/// Backing store with replication bookkeeping
pub struct ReplicatedStore<S: Store> {
    inner: S,
    replica_id: u64,
    registry: ReplicationRegistry,
    checkpoints: Checkpoints,
    logs: EventLogStore,
    log_ids: Singleton<IdCounter>,
    notify: broadcast::Sender<EventLog>,
}

impl<S: Store> std::fmt::Debug for ReplicatedStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("replica_id", &self.replica_id)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<S: Store> ReplicatedStore<S> {
    /// Open `inner` as replica `replica_id`
    ///
    /// Initializes the persisted store version and this replica's
    /// checkpoint on first use.
    ///
    /// # Errors
    ///
    /// `IncompatibleStoreVersion` when `inner` was initialized under a
    /// different `STORE_VERSION`.
    pub fn open(inner: S, replica_id: u64, registry: ReplicationRegistry) -> Result<Self> {
        let checkpoints = Checkpoints::new();
        let version: Singleton<StoreVersion> = Singleton::new(reserved::STORE_VERSION);

        inner.update(|tx| {
            match version.try_get(&*tx)? {
                Some(v) if v.version != STORE_VERSION => {
                    return Err(Error::IncompatibleStoreVersion {
                        local: STORE_VERSION,
                        remote: v.version,
                    });
                }
                Some(_) => {}
                None => {
                    version.set(
                        tx,
                        StoreVersion {
                            version: STORE_VERSION,
                        },
                    )?;
                }
            }
            if checkpoints.get(&*tx, replica_id)?.is_none() {
                checkpoints.merge(
                    tx,
                    Checkpoint::new(replica_id, VersionVector::from_entries([(replica_id, 0)])),
                )?;
            }
            Ok(())
        })?;

        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        info!(target: "tessera::replication", replica_id, "replicated store opened");
        Ok(Self {
            inner,
            replica_id,
            registry,
            checkpoints,
            logs: EventLogStore::new(),
            log_ids: Singleton::new(reserved::ID_ALLOCATOR),
            notify,
        })
    }

    /// Id of the local replica
    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    /// Schema version this store speaks
    pub fn store_version(&self) -> u32 {
        STORE_VERSION
    }

    /// Replicators in use
    pub fn registry(&self) -> &ReplicationRegistry {
        &self.registry
    }

    /// Backing store; writes through it are not replicated
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Checkpoint table
    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    /// Event log store
    pub fn logs(&self) -> &EventLogStore {
        &self.logs
    }

    /// Receive every log committed locally from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventLog> {
        self.notify.subscribe()
    }

    /// Checkpoint of the local replica
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.inner.view(|tx| {
            Ok(self
                .checkpoints
                .get(tx, self.replica_id)?
                .unwrap_or_else(|| Checkpoint::new(self.replica_id, VersionVector::new())))
        })
    }

    /// Every known checkpoint
    pub fn get_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.inner.view(|tx| self.checkpoints.get_all(tx))
    }

    /// Merge checkpoints learned from a peer
    pub fn merge_checkpoints(&self, checkpoints: Vec<Checkpoint>) -> Result<Vec<Checkpoint>> {
        self.inner
            .update(|tx| self.checkpoints.merge_all(tx, checkpoints))
    }

    /// Every live replicated record as a write event
    pub fn dump(&self) -> Result<Vec<Event>> {
        self.inner.view(|tx| {
            let mut events = Vec::new();
            for r in self.registry.all() {
                events.extend(r.dump(tx)?);
            }
            Ok(events)
        })
    }

    /// Stored logs a replica at `version` may not have seen
    pub fn logs_after(&self, version: &VersionVector) -> Result<Vec<EventLog>> {
        self.inner.view(|tx| self.logs.get_all_after(tx, version))
    }

    /// Minimal logs that bring a replica at `version` up to date
    pub fn compressed_delta(&self, version: &VersionVector) -> Result<Vec<EventLog>> {
        self.inner
            .view(|tx| self.logs.get_compressed_delta(tx, &self.registry, version))
    }

    /// Apply a full dump received from a peer at `version`
    ///
    /// Returns the local checkpoint after merging `version` into it.
    pub fn apply_events(&self, events: Vec<Event>, version: &VersionVector) -> Result<Checkpoint> {
        let count = events.len();
        let checkpoint = self.inner.update(|tx| {
            for e in &events {
                self.apply_one(tx, e)?;
            }
            self.checkpoints
                .merge(tx, Checkpoint::new(self.replica_id, version.clone()))
        })?;
        debug!(target: "tessera::replication", count, "applied dump");
        Ok(checkpoint)
    }

    /// Apply event logs received from a peer
    ///
    /// Incoming events are filtered so that only the newest event of each
    /// record is applied, and records this replica deleted in any log newer
    /// than the oldest incoming one stay deleted. Origin checkpoints are
    /// merged and the logs are stored for relaying. Everything happens in
    /// one transaction.
    ///
    /// Returns the local checkpoint, which now covers every applied log.
    pub fn apply_event_logs(&self, logs: Vec<EventLog>) -> Result<Checkpoint> {
        if logs.is_empty() {
            return self.checkpoint();
        }

        let checkpoint = self.inner.update(|tx| {
            let mut deletes = DeleteFilter::new(None);
            for l in self.logs.get_all_after(&*tx, &min_version(&logs))? {
                for e in l.events {
                    deletes.add_event(tx.as_read(), e)?;
                }
            }

            let mut filter = ReplicationFilter::new(self.registry.clone(), Some(Box::new(deletes)));
            let mut origins: BTreeMap<u64, Checkpoint> = BTreeMap::new();
            for l in &logs {
                for e in &l.events {
                    match filter.add_event(tx.as_read(), e.clone()) {
                        Ok(()) => {}
                        Err(Error::ReplicatorNotFound(_)) => {
                            warn!(
                                target: "tessera::replication",
                                log_id = l.id,
                                replica_id = l.replica_id(),
                                ns = %e.namespace,
                                id = e.id,
                                "skipping event without replicator"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                origins
                    .entry(l.replica_id())
                    .or_insert_with(|| Checkpoint::new(l.replica_id(), VersionVector::new()))
                    .version
                    .update(&l.checkpoint.version);
            }

            for e in filter.events() {
                self.apply_one(tx, &e)?;
            }

            self.checkpoints.merge_all(tx, origins.into_values())?;
            let checkpoint = self
                .checkpoints
                .merge(tx, Checkpoint::new(self.replica_id, max_version(&logs)))?;
            for l in &logs {
                self.logs.insert(tx, l)?;
            }
            Ok(checkpoint)
        })?;

        debug!(
            target: "tessera::replication",
            logs = logs.len(),
            local_version = checkpoint.local_version(),
            "applied event logs"
        );
        Ok(checkpoint)
    }

    /// Delete logs every live replica has observed
    pub fn garbage_collect(&self) -> Result<usize> {
        self.inner.update(|tx| {
            let threshold = self.checkpoints.min_version(&*tx)?;
            self.logs.garbage_collect(tx, &threshold)
        })
    }

    fn apply_one(&self, tx: &mut dyn WriteTx, e: &Event) -> Result<()> {
        match self.registry.get(e.namespace) {
            Ok(r) => r.apply_event(tx, e),
            Err(Error::ReplicatorNotFound(_)) => {
                warn!(
                    target: "tessera::replication",
                    ns = %e.namespace,
                    id = e.id,
                    "skipping event without replicator"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn commit_log(&self, tx: &mut dyn WriteTx, events: Vec<Event>) -> Result<EventLog> {
        let counter = self.log_ids.transform(tx, |c| {
            c.next_id = c
                .next_id
                .checked_add(1)
                .ok_or_else(|| Error::InvalidOperation("id space exhausted".into()))?;
            Ok(())
        })?;
        let checkpoint = self.checkpoints.increment(tx, self.replica_id)?;
        let log = EventLog {
            id: counter.next_id - 1,
            checkpoint,
            events,
        };
        self.logs.insert(tx, &log)?;
        Ok(log)
    }
}

impl<S: Store> Store for ReplicatedStore<S> {
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T>) -> Result<T> {
        self.inner.view(f)
    }

    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T>) -> Result<T> {
        let (value, log) = self.inner.update(|tx| {
            let mut rtx = ReplicatedTx {
                inner: &mut *tx,
                pending: PendingEvents::new(self.replica_id),
            };
            let value = f(&mut rtx)?;
            let events = rtx.pending.take();
            if events.is_empty() {
                return Ok((value, None));
            }
            let log = self.commit_log(tx, events)?;
            Ok((value, Some(log)))
        })?;

        if let Some(log) = log {
            debug!(
                target: "tessera::replication",
                log_id = log.id,
                events = log.events.len(),
                local_version = log.local_version(),
                "committed event log"
            );
            // No subscribers is fine
            let _ = self.notify.send(log);
        }
        Ok(value)
    }
}
