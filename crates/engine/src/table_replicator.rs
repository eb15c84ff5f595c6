//! Table replication
//!
//! `TableReplicator::register` wires a table into replication: it attaches
//! the hooks that turn local writes into events and registers a replicator
//! that applies remote events back onto the table.
//!
//! ## Applying a write event
//!
//! | local record | version comparison     | outcome                      |
//! |--------------|------------------------|------------------------------|
//! | absent       |                        | insert incoming              |
//! | present      | local precedes         | store `merge(incoming, local)` |
//! | present      | concurrent             | store `on_conflict(incoming, local)` |
//! | present      | local equal or newer   | nothing                      |
//!
//! Delete events remove the record; deleting an absent record is a no-op.

use tessera_core::{decode, Error, Namespace, Record, Replicated, Result, VersionVector};
use tessera_primitives::Table;
use tessera_storage::{ReadTx, WriteTx};
use tracing::trace;

use crate::event::Event;
use crate::filter::{EventFilter, RecordFilter, RecordSource};
use crate::replicator::{pending_events, ReplicationRegistry, Replicator, ReplicatorOptions};

/// Replicator of one table
pub struct TableReplicator<T: Record + Replicated> {
    table: Table<T>,
    options: ReplicatorOptions<T>,
}

impl<T: Record + Replicated> Clone for TableReplicator<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T: Record + Replicated> TableReplicator<T> {
    /// Replicate `table` with `options`
    ///
    /// Attaches the local event hooks to `table` and registers the
    /// replicator in `registry` under the table's namespace.
    pub fn register(
        registry: &ReplicationRegistry,
        table: &Table<T>,
        options: ReplicatorOptions<T>,
    ) -> Self {
        let ns = table.namespace();

        let set_options = options.clone();
        table.on_set(move |tx, next: &mut T, prev: Option<&T>| {
            let Some(replica) = pending_events(tx).map(|p| p.replica_id()) else {
                return Ok(());
            };
            if let Some(prev) = prev {
                next.version_mut().update(prev.version());
            }
            next.version_mut().increment(replica);
            let record = set_options.project(tx.as_read(), next, prev)?;
            let event = Event::write(ns, next.id(), next.version().clone(), record);
            if let Some(pending) = pending_events(tx) {
                pending.push(event);
            }
            Ok(())
        });

        table.on_delete(move |tx, prev: &T| {
            if let Some(pending) = pending_events(tx) {
                let mut version = prev.version().clone();
                version.increment(pending.replica_id());
                pending.push(Event::delete(ns, prev.id(), version));
            }
            Ok(())
        });

        let replicator = Self {
            table: table.clone(),
            options,
        };
        registry.register(std::sync::Arc::new(replicator.clone()));
        replicator
    }

    /// Replicated table
    pub fn table(&self) -> &Table<T> {
        &self.table
    }
}

impl<T: Record + Replicated> RecordSource for TableReplicator<T> {
    fn namespace(&self) -> Namespace {
        self.table.namespace()
    }

    fn load(&self, tx: &dyn ReadTx, id: u64) -> Result<Option<(VersionVector, Vec<u8>)>> {
        match self.table.try_get(tx, id)? {
            Some(r) => Ok(Some((r.version().clone(), self.options.project(tx, &r, None)?))),
            None => Ok(None),
        }
    }
}

impl<T: Record + Replicated> Replicator for TableReplicator<T> {
    fn namespace(&self) -> Namespace {
        self.table.namespace()
    }

    fn event_filter(&self) -> Box<dyn EventFilter> {
        Box::new(RecordFilter::new(self.clone()))
    }

    fn apply_event(&self, tx: &mut dyn WriteTx, event: &Event) -> Result<()> {
        if event.delete {
            return match self.table.delete(tx, event.id) {
                Err(e) if e.is_not_found() => Ok(()),
                other => other.map(|_| ()),
            };
        }

        let Some(bytes) = &event.record else {
            return Err(Error::InvalidOperation(format!(
                "write event without record: {}:{}",
                event.namespace, event.id
            )));
        };
        let next: T = decode(bytes)?;

        let Some(local) = self.table.try_get(&*tx, next.id())? else {
            self.table.insert(tx, next)?;
            return Ok(());
        };

        let (d, ordered) = local.version().compare(next.version());
        if !ordered {
            let winner = self.options.resolve(tx, next, local)?;
            self.table.upsert(tx, winner)?;
        } else if d < 0 {
            let merged = self.options.apply_merge(tx, next, &local);
            self.table.update(tx, merged)?;
        } else {
            trace!(
                target: "tessera::replication",
                ns = %event.namespace,
                id = event.id,
                "event already applied"
            );
        }
        Ok(())
    }

    fn dump(&self, tx: &dyn ReadTx) -> Result<Vec<Event>> {
        let ns = self.table.namespace();
        self.table
            .get_all(tx)?
            .into_iter()
            .map(|r| {
                let record = self.options.project(tx, &r, None)?;
                Ok(Event::write(ns, r.id(), r.version().clone(), record))
            })
            .collect()
    }
}
