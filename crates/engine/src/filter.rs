//! Event filters
//!
//! A filter folds a stream of events into the smallest set that reaches the
//! same state. For each record only the newest event survives; concurrent
//! events are replaced by the record's current local state so the receiver
//! resolves the conflict against what this replica actually holds.
//!
//! Filters chain through `base`. An event rejected by the base is never
//! seen by the outer filter. Chaining one filter per log, newest log first,
//! drops every event that a newer log supersedes.

use std::collections::{BTreeMap, HashMap};

use tessera_core::{Namespace, Result, VersionVector};
use tessera_storage::ReadTx;

use crate::event::{Event, EventKey};
use crate::replicator::ReplicationRegistry;

/// Folds events into a minimal set
pub trait EventFilter {
    /// True if `event` is still relevant given what the filter holds
    ///
    /// May record `event` as a side effect.
    fn test(&mut self, event: &Event) -> bool;

    /// Offer `event`; `tx` supplies current local state when needed
    fn add_event(&mut self, tx: &dyn ReadTx, event: Event) -> Result<()>;

    /// Events selected so far
    fn events(&self) -> Vec<Event>;
}

/// Filter in which deletes win
///
/// Once a record has a delete, every later event for it is rejected,
/// including other deletes. Seeded with local deletes it keeps incoming
/// writes from resurrecting records this replica removed.
#[derive(Default)]
pub struct DeleteFilter {
    deletes: HashMap<EventKey, Event>,
    base: Option<Box<dyn EventFilter>>,
}

impl DeleteFilter {
    /// Filter over `base`
    pub fn new(base: Option<Box<dyn EventFilter>>) -> Self {
        Self {
            deletes: HashMap::new(),
            base,
        }
    }

    /// Number of records with a delete
    pub fn len(&self) -> usize {
        self.deletes.len()
    }

    /// True when no delete has been seen
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
    }
}

impl EventFilter for DeleteFilter {
    fn test(&mut self, event: &Event) -> bool {
        if let Some(base) = &mut self.base {
            if !base.test(event) {
                return false;
            }
        }
        let key = event.key();
        if self.deletes.contains_key(&key) {
            return false;
        }
        if event.delete {
            self.deletes.insert(key, event.clone());
        }
        true
    }

    fn add_event(&mut self, _tx: &dyn ReadTx, event: Event) -> Result<()> {
        if event.delete {
            self.deletes.insert(event.key(), event);
        }
        Ok(())
    }

    fn events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.deletes.values().cloned().collect();
        events.sort_by_key(|e| e.key());
        events
    }
}

/// Filter dispatching each event to its namespace's replicator filter
pub struct ReplicationFilter {
    registry: ReplicationRegistry,
    filters: BTreeMap<Namespace, Box<dyn EventFilter>>,
    base: Option<Box<dyn EventFilter>>,
}

impl ReplicationFilter {
    /// Filter over `base` using the replicators in `registry`
    pub fn new(registry: ReplicationRegistry, base: Option<Box<dyn EventFilter>>) -> Self {
        Self {
            registry,
            filters: BTreeMap::new(),
            base,
        }
    }

    fn filter(&mut self, ns: Namespace) -> Result<&mut Box<dyn EventFilter>> {
        if !self.filters.contains_key(&ns) {
            let f = self.registry.get(ns)?.event_filter();
            self.filters.insert(ns, f);
        }
        self.filters
            .get_mut(&ns)
            .ok_or(tessera_core::Error::ReplicatorNotFound(ns))
    }
}

impl EventFilter for ReplicationFilter {
    fn test(&mut self, event: &Event) -> bool {
        if let Some(base) = &mut self.base {
            if !base.test(event) {
                return false;
            }
        }
        match self.filters.get_mut(&event.namespace) {
            Some(f) => f.test(event),
            None => true,
        }
    }

    /// # Errors
    ///
    /// `ReplicatorNotFound` when no replicator handles the event's namespace.
    fn add_event(&mut self, tx: &dyn ReadTx, event: Event) -> Result<()> {
        if !self.test(&event) {
            return Ok(());
        }
        self.filter(event.namespace)?.add_event(tx, event)
    }

    fn events(&self) -> Vec<Event> {
        self.filters.values().flat_map(|f| f.events()).collect()
    }
}

/// Current local state of the records in one namespace
pub(crate) trait RecordSource {
    /// Namespace of the records
    fn namespace(&self) -> Namespace;

    /// Version and encoded projection of record `id`, `None` when absent
    fn load(&self, tx: &dyn ReadTx, id: u64) -> Result<Option<(VersionVector, Vec<u8>)>>;
}

/// Per-namespace filter keeping the newest event of each record
///
/// Concurrent events collapse into the record's current local state, and
/// events without a payload (from stored logs) are reloaded the same way.
/// A record that no longer exists becomes a delete with an empty version.
/// Events come out in the order they were first selected.
pub(crate) struct RecordFilter<S> {
    source: S,
    events: HashMap<u64, (u64, Event)>,
    order: u64,
}

impl<S: RecordSource> RecordFilter<S> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            events: HashMap::new(),
            order: 0,
        }
    }

    fn hold(&mut self, event: Event) {
        self.events.insert(event.id, (self.order, event));
        self.order += 1;
    }

    fn load(&mut self, tx: &dyn ReadTx, id: u64) -> Result<()> {
        let ns = self.source.namespace();
        let event = match self.source.load(tx, id)? {
            Some((version, record)) => Event::write(ns, id, version, record),
            None => Event::delete(ns, id, VersionVector::new()),
        };
        self.hold(event);
        Ok(())
    }
}

impl<S: RecordSource> EventFilter for RecordFilter<S> {
    fn test(&mut self, event: &Event) -> bool {
        match self.events.get(&event.id) {
            Some((_, held)) if held.delete => false,
            Some((_, held)) => {
                let (d, ordered) = held.version.compare(&event.version);
                !ordered || d < 0
            }
            None => true,
        }
    }

    fn add_event(&mut self, tx: &dyn ReadTx, event: Event) -> Result<()> {
        if let Some((_, held)) = self.events.get_mut(&event.id) {
            if held.delete {
                held.version.update(&event.version);
                return Ok(());
            }
            let (d, ordered) = held.version.compare(&event.version);
            if !ordered {
                return self.load(tx, event.id);
            }
            if d > 0 {
                return Ok(());
            }
        }
        if !event.delete && event.record.is_none() {
            return self.load(tx, event.id);
        }
        self.hold(event);
        Ok(())
    }

    fn events(&self) -> Vec<Event> {
        let mut held: Vec<&(u64, Event)> = self.events.values().collect();
        held.sort_by_key(|(order, _)| *order);
        held.into_iter().map(|(_, e)| e.clone()).collect()
    }
}
