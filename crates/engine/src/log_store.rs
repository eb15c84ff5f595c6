//! Persisted event logs
//!
//! Every local commit, and every log received from a peer, is kept under
//! `(origin replica, log id)` until all live replicas have observed it.
//! Logs are stored without record payloads: building a delta reloads each
//! record's current state from its table, which is both smaller on disk and
//! never stale.

use std::collections::BTreeMap;

use tessera_core::{decode, encode, reserved, Error, Result, VersionVector};
use tessera_storage::{ReadTx, WriteTx};
use tracing::{debug, warn};

use crate::event::EventLog;
use crate::filter::{EventFilter, ReplicationFilter};
use crate::replicator::ReplicationRegistry;

/// Store of event logs in the reserved log namespace
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLogStore;

impl EventLogStore {
    /// Log store handle
    pub fn new() -> Self {
        Self
    }

    fn key(replica: u64, id: u64) -> String {
        reserved::REPLICATION_LOG.format_composite(replica, id)
    }

    /// Persist `log` without its record payloads
    pub fn insert(&self, tx: &mut dyn WriteTx, log: &EventLog) -> Result<()> {
        tx.put(&Self::key(log.replica_id(), log.id), encode(&log.stripped())?)
    }

    /// Stored log `id` of `replica`
    pub fn get<R: ReadTx + ?Sized>(&self, tx: &R, replica: u64, id: u64) -> Result<Option<EventLog>> {
        tx.get(&Self::key(replica, id))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Every stored log, ordered by replica then log id
    pub fn get_all<R: ReadTx + ?Sized>(&self, tx: &R) -> Result<Vec<EventLog>> {
        tx.scan_prefix(&reserved::REPLICATION_LOG.format_prefix())?
            .iter()
            .map(|b| decode(b))
            .collect()
    }

    /// Logs a replica at `version` may not have seen
    ///
    /// Keeps every log whose origin is missing from `version` or whose local
    /// version is at least `version`'s counter for that origin.
    pub fn get_all_after<R: ReadTx + ?Sized>(&self, tx: &R, version: &VersionVector) -> Result<Vec<EventLog>> {
        let mut logs = self.get_all(tx)?;
        logs.retain(|l| match version.entry(l.replica_id()) {
            Some(seen) => l.local_version() >= seen,
            None => true,
        });
        Ok(logs)
    }

    /// Minimal logs that bring a replica at `version` up to date
    ///
    /// Logs of each origin are filtered newest first through a chain of
    /// filters, so an event survives only if no newer log touches the same
    /// record. Surviving events carry the record's current local state.
    /// Logs left empty are dropped. Events whose namespace has no
    /// replicator are skipped with a warning.
    pub fn get_compressed_delta(
        &self,
        tx: &dyn ReadTx,
        registry: &ReplicationRegistry,
        version: &VersionVector,
    ) -> Result<Vec<EventLog>> {
        let mut by_replica: BTreeMap<u64, Vec<EventLog>> = BTreeMap::new();
        for l in self.get_all_after(tx, version)? {
            by_replica.entry(l.replica_id()).or_default().push(l);
        }

        let mut delta = Vec::new();
        for (replica, mut logs) in by_replica {
            logs.sort_by_key(|l| std::cmp::Reverse(l.local_version()));

            let mut base: Option<Box<dyn EventFilter>> = None;
            let mut kept = Vec::with_capacity(logs.len());
            for mut l in logs {
                let mut filter = ReplicationFilter::new(registry.clone(), base.take());
                for e in std::mem::take(&mut l.events) {
                    let (ns, id) = (e.namespace, e.id);
                    match filter.add_event(tx, e) {
                        Ok(()) => {}
                        Err(Error::ReplicatorNotFound(_)) => {
                            warn!(
                                target: "tessera::replication",
                                log_id = l.id,
                                replica_id = replica,
                                ns = %ns,
                                id,
                                "skipping event without replicator"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                l.events = filter.events();
                if !l.events.is_empty() {
                    kept.push(l);
                }
                base = Some(Box::new(filter));
            }
            kept.reverse();
            delta.extend(kept);
        }
        Ok(delta)
    }

    /// Delete logs every replica at `threshold` has observed
    ///
    /// Logs of origins missing from `threshold` are kept.
    pub fn garbage_collect(&self, tx: &mut dyn WriteTx, threshold: &VersionVector) -> Result<usize> {
        let logs = self.get_all(&*tx)?;
        let mut removed = 0;
        for l in logs {
            let collectable = threshold
                .entry(l.replica_id())
                .map_or(false, |seen| l.local_version() <= seen);
            if collectable {
                tx.delete(&Self::key(l.replica_id(), l.id))?;
                removed += 1;
            }
        }
        debug!(target: "tessera::replication", removed, "event logs collected");
        Ok(removed)
    }
}
