//! Singleton replication
//!
//! Same rules as table replication for a single record with id 0. Only
//! sets are replicated; clearing a singleton stays local.

use std::sync::Arc;

use tessera_core::{decode, Error, Namespace, Replicated, Result, VersionVector};
use tessera_primitives::Singleton;
use tessera_storage::{ReadTx, WriteTx};
use tracing::trace;

use crate::event::Event;
use crate::filter::{EventFilter, RecordFilter, RecordSource};
use crate::replicator::{pending_events, ReplicationRegistry, Replicator, ReplicatorOptions};

const SINGLETON_ID: u64 = 0;

/// Replicator of one singleton
pub struct SingletonReplicator<T: Replicated> {
    singleton: Singleton<T>,
    options: ReplicatorOptions<T>,
}

impl<T: Replicated> Clone for SingletonReplicator<T> {
    fn clone(&self) -> Self {
        Self {
            singleton: self.singleton.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T: Replicated> SingletonReplicator<T> {
    /// Replicate `singleton` with `options`
    pub fn register(
        registry: &ReplicationRegistry,
        singleton: &Singleton<T>,
        options: ReplicatorOptions<T>,
    ) -> Self {
        let ns = singleton.namespace();

        let set_options = options.clone();
        singleton.on_set(move |tx, next: &mut T, prev: Option<&T>| {
            let Some(replica) = pending_events(tx).map(|p| p.replica_id()) else {
                return Ok(());
            };
            if let Some(prev) = prev {
                next.version_mut().update(prev.version());
            }
            next.version_mut().increment(replica);
            let record = set_options.project(tx.as_read(), next, prev)?;
            let event = Event::write(ns, SINGLETON_ID, next.version().clone(), record);
            if let Some(pending) = pending_events(tx) {
                pending.push(event);
            }
            Ok(())
        });

        let replicator = Self {
            singleton: singleton.clone(),
            options,
        };
        registry.register(Arc::new(replicator.clone()));
        replicator
    }

    /// Replicated singleton
    pub fn singleton(&self) -> &Singleton<T> {
        &self.singleton
    }

    fn current(&self, tx: &dyn ReadTx) -> Result<Option<T>> {
        match self.singleton.get(tx) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<T: Replicated> RecordSource for SingletonReplicator<T> {
    fn namespace(&self) -> Namespace {
        self.singleton.namespace()
    }

    fn load(&self, tx: &dyn ReadTx, _id: u64) -> Result<Option<(VersionVector, Vec<u8>)>> {
        match self.current(tx)? {
            Some(v) => Ok(Some((v.version().clone(), self.options.project(tx, &v, None)?))),
            None => Ok(None),
        }
    }
}

impl<T: Replicated> Replicator for SingletonReplicator<T> {
    fn namespace(&self) -> Namespace {
        self.singleton.namespace()
    }

    fn event_filter(&self) -> Box<dyn EventFilter> {
        Box::new(RecordFilter::new(self.clone()))
    }

    fn apply_event(&self, tx: &mut dyn WriteTx, event: &Event) -> Result<()> {
        let Some(bytes) = &event.record else {
            if event.delete {
                return Ok(());
            }
            return Err(Error::InvalidOperation(format!(
                "write event without record: {}",
                event.namespace
            )));
        };
        let next: T = decode(bytes)?;

        let Some(local) = self.current(tx.as_read())? else {
            self.singleton.set(tx, next)?;
            return Ok(());
        };

        let (d, ordered) = local.version().compare(next.version());
        if !ordered {
            let winner = self.options.resolve(tx, next, local)?;
            self.singleton.set(tx, winner)?;
        } else if d < 0 {
            let merged = self.options.apply_merge(tx, next, &local);
            self.singleton.set(tx, merged)?;
        } else {
            trace!(target: "tessera::replication", ns = %event.namespace, "event already applied");
        }
        Ok(())
    }

    fn dump(&self, tx: &dyn ReadTx) -> Result<Vec<Event>> {
        match self.singleton.try_get(tx)? {
            Some(v) => {
                let record = self.options.project(tx, &v, None)?;
                Ok(vec![Event::write(
                    self.singleton.namespace(),
                    SINGLETON_ID,
                    v.version().clone(),
                    record,
                )])
            }
            None => Ok(Vec::new()),
        }
    }
}
