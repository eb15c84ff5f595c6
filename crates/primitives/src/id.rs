//! Record id generation
//!
//! Tables never assign ids. Callers draw them from an `IdGenerator`;
//! `IdAllocator` is the persisted implementation. It reserves ids in
//! blocks from a counter singleton and hands them out from memory, so only
//! one write in `block_size` touches the store.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tessera_core::{reserved, Error, Namespace, ReplicationConfig, Result};
use tessera_storage::Store;
use tracing::debug;

use crate::singleton::Singleton;

/// Source of fresh record ids
pub trait IdGenerator: Send + Sync {
    /// Next unused id
    fn generate_id(&self) -> Result<u64>;
}

impl<F> IdGenerator for F
where
    F: Fn() -> Result<u64> + Send + Sync,
{
    fn generate_id(&self) -> Result<u64> {
        self()
    }
}

/// Persisted allocation counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounter {
    /// First id not yet reserved by anyone
    pub next_id: u64,
}

impl Default for IdCounter {
    fn default() -> Self {
        Self { next_id: 1 }
    }
}

#[derive(Debug, Default)]
struct Reservation {
    next: u64,
    end: u64,
}

/// Block-reserving `IdGenerator` over a store
pub struct IdAllocator<S: Store> {
    store: S,
    counter: Singleton<IdCounter>,
    block_size: u64,
    reservation: Mutex<Reservation>,
}

impl<S: Store> IdAllocator<S> {
    /// Allocator using the reserved id allocator namespace
    pub fn new(store: S, block_size: u64) -> Self {
        Self::with_namespace(store, reserved::ID_ALLOCATOR, block_size)
    }

    /// Allocator sized from configuration
    pub fn from_config(store: S, config: &ReplicationConfig) -> Self {
        Self::new(store, config.id_reservation_size)
    }

    /// Allocator persisting its counter under `ns`
    pub fn with_namespace(store: S, ns: Namespace, block_size: u64) -> Self {
        Self {
            store,
            counter: Singleton::new(ns),
            block_size: block_size.max(1),
            reservation: Mutex::new(Reservation::default()),
        }
    }

    /// Number of ids reserved per store write
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Reserve `block_size` ids, returning the first
    ///
    /// The ids `start..start + block_size` are never returned again by this
    /// or any other allocator sharing the counter.
    pub fn reserve_block(&self) -> Result<u64> {
        let size = self.block_size;
        let counter = self.store.update(|tx| {
            self.counter.transform(tx, |c| {
                c.next_id = c.next_id.checked_add(size).ok_or_else(|| {
                    Error::InvalidOperation("id space exhausted".into())
                })?;
                Ok(())
            })
        })?;
        let start = counter.next_id - size;
        debug!(target: "tessera::id", ns = %self.counter.namespace(), start, size, "reserved id block");
        Ok(start)
    }
}

impl<S: Store> IdGenerator for IdAllocator<S> {
    fn generate_id(&self) -> Result<u64> {
        let mut r = self.reservation.lock();
        if r.next < r.end {
            let id = r.next;
            r.next += 1;
            return Ok(id);
        }
        let start = self.reserve_block()?;
        r.next = start + 1;
        r.end = start + self.block_size;
        Ok(start)
    }
}
