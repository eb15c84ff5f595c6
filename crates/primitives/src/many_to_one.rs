//! Many-to-one relation between two tables
//!
//! A secondary index over the child table keyed by parent id. With
//! `cascade_delete`, deleting a parent deletes every child indexed under it
//! in the same transaction; any failure aborts the whole delete.

use std::sync::Arc;
use std::time::Instant;

use tessera_core::{Namespace, Record, Result};
use tessera_storage::ReadTx;
use tracing::debug;

use crate::index::{scan_index, Condition, IndexKey, SecondaryIndex};
use crate::table::Table;

/// Options of a many-to-one relation
pub struct ManyToOneOptions<C> {
    /// Children failing the predicate are not indexed
    pub condition: Option<Condition<C>>,
    /// Delete children together with their parent
    pub cascade_delete: bool,
}

impl<C> Default for ManyToOneOptions<C> {
    fn default() -> Self {
        Self {
            condition: None,
            cascade_delete: false,
        }
    }
}

impl<C> ManyToOneOptions<C> {
    /// Delete children together with their parent
    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }

    /// Only index children for which `f` returns true
    pub fn condition(mut self, f: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(f));
        self
    }
}

/// Relation from child records to the parent record they reference
pub struct ManyToOne<C: Record, P: Record> {
    index: SecondaryIndex<C, u64>,
    parents: Table<P>,
}

impl<C: Record, P: Record> Clone for ManyToOne<C, P> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            parents: self.parents.clone(),
        }
    }
}

impl<C: Record, P: Record> ManyToOne<C, P> {
    /// Relate `children` to `parents` through `parent_id(child)`
    pub fn new(
        ns: Namespace,
        children: &Table<C>,
        parents: &Table<P>,
        parent_id: impl Fn(&C) -> u64 + Send + Sync + 'static,
        options: ManyToOneOptions<C>,
    ) -> Self {
        if options.cascade_delete {
            let weak_children = children.downgrade();
            parents.on_delete(move |tx, parent| {
                let Some(children) = weak_children.upgrade() else {
                    return Ok(());
                };
                let start = Instant::now();
                let ids = scan_index(&*tx, ns, &parent.id().index_key())?;
                for id in &ids {
                    children.delete(tx, *id)?;
                }
                debug!(
                    target: "tessera::index",
                    ns = %ns,
                    parent = parent.id(),
                    children = ids.len(),
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "ManyToOne cascade delete"
                );
                Ok(())
            });
        }

        Self {
            index: SecondaryIndex::from_parts(ns, children, Arc::new(parent_id), options.condition),
            parents: parents.clone(),
        }
    }

    /// Underlying secondary index
    pub fn index(&self) -> &SecondaryIndex<C, u64> {
        &self.index
    }

    /// Children of the parent with id `parent_id`
    pub fn get_all_by_ref_id<R: ReadTx + ?Sized>(&self, tx: &R, parent_id: u64) -> Result<Vec<C>> {
        self.index.get_all(tx, &parent_id)
    }

    /// Children of `parent`
    pub fn get_all_by_ref<R: ReadTx + ?Sized>(&self, tx: &R, parent: &P) -> Result<Vec<C>> {
        self.get_all_by_ref_id(tx, parent.id())
    }

    /// Ids of the children of the parent with id `parent_id`
    pub fn get_all_ids_by_ref_id<R: ReadTx + ?Sized>(&self, tx: &R, parent_id: u64) -> Result<Vec<u64>> {
        self.index.get_all_ids(tx, &parent_id)
    }

    /// Parent referenced by `child`
    pub fn get_ref<R: ReadTx + ?Sized>(&self, tx: &R, child: &C) -> Result<P> {
        self.parents.get(tx, self.index.key_of(child))
    }

    /// Drop every entry and re-index the child table
    pub fn rebuild(&self, tx: &mut dyn tessera_storage::WriteTx) -> Result<()> {
        self.index.rebuild(tx)
    }
}
