//! Unique index: a secondary index holding at most one id per key
//!
//! The uniqueness check runs as a set hook registered ahead of the index's
//! own hooks, so it sees the index before the new entry is written. When a
//! different record already owns the key, the write fails with
//! `UniqueConstraintViolated`, or the configured resolver decides what
//! happens to the conflicting record.

use std::sync::Arc;

use tessera_core::{Error, Namespace, Record, Result};
use tessera_storage::{ReadTx, WriteTx};
use tracing::debug;

use crate::index::{passes, scan_index, Condition, IndexKey, SecondaryIndex};
use crate::table::Table;

/// Resolver invoked with `(tx, table, new, conflicting)`
///
/// Returning `Ok` lets the write proceed; the resolver is expected to have
/// deleted or re-keyed the conflicting record.
pub type ConflictResolver<T> =
    Arc<dyn Fn(&mut dyn WriteTx, &Table<T>, &T, T) -> Result<()> + Send + Sync>;

/// Options of a unique index
pub struct UniqueIndexOptions<T: Record> {
    /// Records failing the predicate are neither checked nor indexed
    pub condition: Option<Condition<T>>,
    /// Conflict resolver; conflicts fail the write when absent
    pub on_conflict: Option<ConflictResolver<T>>,
}

impl<T: Record> Default for UniqueIndexOptions<T> {
    fn default() -> Self {
        Self {
            condition: None,
            on_conflict: None,
        }
    }
}

impl<T: Record> UniqueIndexOptions<T> {
    /// Only index records for which `f` returns true
    pub fn condition(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(f));
        self
    }

    /// Resolve conflicts with `f` instead of failing
    pub fn on_conflict(
        mut self,
        f: impl Fn(&mut dyn WriteTx, &Table<T>, &T, T) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_conflict = Some(Arc::new(f));
        self
    }
}

/// Secondary index constrained to one id per key
pub struct UniqueIndex<T: Record, K> {
    index: SecondaryIndex<T, K>,
}

impl<T: Record, K> Clone for UniqueIndex<T, K> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
        }
    }
}

impl<T, K> UniqueIndex<T, K>
where
    T: Record,
    K: IndexKey + 'static,
{
    /// Unique index over `key(record)` with no resolver
    pub fn new(ns: Namespace, table: &Table<T>, key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Self::with_options(ns, table, key, UniqueIndexOptions::default())
    }

    /// Unique index with explicit options
    pub fn with_options(
        ns: Namespace,
        table: &Table<T>,
        key: impl Fn(&T) -> K + Send + Sync + 'static,
        options: UniqueIndexOptions<T>,
    ) -> Self {
        let key: Arc<dyn Fn(&T) -> K + Send + Sync> = Arc::new(key);
        {
            let key = Arc::clone(&key);
            let condition = options.condition.clone();
            let resolver = options.on_conflict;
            let weak = table.downgrade();
            table.on_set(move |tx, m, p| {
                if !passes(&condition, m) {
                    return Ok(());
                }
                let mk = key(m).index_key();
                if let Some(p) = p {
                    if passes(&condition, p) && key(p).index_key() == mk {
                        return Ok(());
                    }
                }

                let conflicting = scan_index(&*tx, ns, &mk)?
                    .into_iter()
                    .find(|id| *id != m.id());
                let Some(conflicting) = conflicting else {
                    return Ok(());
                };

                debug!(
                    target: "tessera::index",
                    ns = %ns,
                    id = m.id(),
                    conflicting,
                    resolved = resolver.is_some(),
                    "UniqueIndex conflict"
                );
                match &resolver {
                    None => Err(Error::UniqueConstraintViolated { namespace: ns }),
                    Some(resolve) => {
                        let table = weak.upgrade().ok_or_else(|| {
                            Error::InvalidOperation("unique index outlived its table".into())
                        })?;
                        let c = table.get(&*tx, conflicting)?;
                        resolve(tx, &table, m, c)
                    }
                }
            });
        }

        Self {
            index: SecondaryIndex::from_parts(ns, table, key, options.condition),
        }
    }

    /// Underlying secondary index
    pub fn index(&self) -> &SecondaryIndex<T, K> {
        &self.index
    }

    /// The record owning `key`
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when no record owns the key.
    pub fn get<R, Q>(&self, tx: &R, key: &Q) -> Result<T>
    where
        R: ReadTx + ?Sized,
        Q: IndexKey + ?Sized,
    {
        let id = self.get_id(tx, key)?;
        self.index.table().get(tx, id)
    }

    /// Id of the record owning `key`
    pub fn get_id<R, Q>(&self, tx: &R, key: &Q) -> Result<u64>
    where
        R: ReadTx + ?Sized,
        Q: IndexKey + ?Sized,
    {
        self.index
            .get_all_ids(tx, key)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::not_found(format!("{}<unique key>", self.index.namespace().format_prefix()))
            })
    }

    /// Records owning each of `keys`, in order; fails if any key is unowned
    pub fn get_many<R, Q>(&self, tx: &R, keys: &[&Q]) -> Result<Vec<T>>
    where
        R: ReadTx + ?Sized,
        Q: IndexKey + ?Sized,
    {
        keys.iter().map(|k| self.get(tx, *k)).collect()
    }

    /// Ids owning each of `keys`, in order; fails if any key is unowned
    pub fn get_many_ids<R, Q>(&self, tx: &R, keys: &[&Q]) -> Result<Vec<u64>>
    where
        R: ReadTx + ?Sized,
        Q: IndexKey + ?Sized,
    {
        keys.iter().map(|k| self.get_id(tx, *k)).collect()
    }

    /// Delete the records owning `keys`; nothing is deleted if any key is unowned
    pub fn delete<Q>(&self, tx: &mut dyn WriteTx, keys: &[&Q]) -> Result<Vec<u64>>
    where
        Q: IndexKey + ?Sized,
    {
        let ids = self.get_many_ids(&*tx, keys)?;
        for id in &ids {
            self.index.table().delete(tx, *id)?;
        }
        Ok(ids)
    }

    /// Drop every entry and re-index the whole table
    pub fn rebuild(&self, tx: &mut dyn WriteTx) -> Result<()> {
        self.index.rebuild(tx)
    }
}
