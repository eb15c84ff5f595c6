//! Per-replica checkpoints
//!
//! The checkpoint table holds, for every replica ever seen, the latest
//! version vector that replica is known to have reached. Stored checkpoints
//! only move forward: every write is merged with the stored value by a set
//! hook, so applying an older checkpoint never regresses one.

use tessera_core::{reserved, Result, VersionVector};
use tessera_primitives::Table;
use tessera_storage::{ReadTx, WriteTx};

use crate::event::Checkpoint;

/// Checkpoint table
#[derive(Clone, Debug)]
pub struct Checkpoints {
    table: Table<Checkpoint>,
}

impl Default for Checkpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoints {
    /// Checkpoints in the reserved checkpoint namespace
    pub fn new() -> Self {
        let table = Table::new(reserved::REPLICATION_CHECKPOINT);
        table.on_set(|_tx, next: &mut Checkpoint, prev: Option<&Checkpoint>| {
            if let Some(prev) = prev {
                next.version.update(&prev.version);
                next.deleted |= prev.deleted;
            }
            Ok(())
        });
        Self { table }
    }

    /// Underlying table
    pub fn table(&self) -> &Table<Checkpoint> {
        &self.table
    }

    /// Checkpoint of `replica`, if known
    pub fn get<R: ReadTx + ?Sized>(&self, tx: &R, replica: u64) -> Result<Option<Checkpoint>> {
        self.table.try_get(tx, replica)
    }

    /// Every known checkpoint
    pub fn get_all<R: ReadTx + ?Sized>(&self, tx: &R) -> Result<Vec<Checkpoint>> {
        self.table.get_all(tx)
    }

    /// Count one more local commit by `replica`
    pub fn increment(&self, tx: &mut dyn WriteTx, replica: u64) -> Result<Checkpoint> {
        self.table.transform_or_default(tx, replica, |c| {
            c.id = replica;
            c.version.increment(replica);
            Ok(())
        })
    }

    /// Merge `checkpoint` into the stored one for its replica
    pub fn merge(&self, tx: &mut dyn WriteTx, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let id = checkpoint.id;
        self.table.transform_or_default(tx, id, move |c| {
            c.id = id;
            c.version.update(&checkpoint.version);
            c.deleted |= checkpoint.deleted;
            Ok(())
        })
    }

    /// Merge every checkpoint in `checkpoints`
    pub fn merge_all(
        &self,
        tx: &mut dyn WriteTx,
        checkpoints: impl IntoIterator<Item = Checkpoint>,
    ) -> Result<Vec<Checkpoint>> {
        checkpoints
            .into_iter()
            .map(|c| self.merge(tx, c))
            .collect()
    }

    /// Retire `replica`; its checkpoint stops holding back log collection
    pub fn mark_deleted(&self, tx: &mut dyn WriteTx, replica: u64) -> Result<Checkpoint> {
        self.merge(
            tx,
            Checkpoint {
                id: replica,
                version: VersionVector::new(),
                deleted: true,
            },
        )
    }

    /// Pointwise minimum over live checkpoints
    ///
    /// Every live replica has observed everything at or below this vector,
    /// so logs under it are safe to collect.
    pub fn min_version<R: ReadTx + ?Sized>(&self, tx: &R) -> Result<VersionVector> {
        let mut live = self.get_all(tx)?.into_iter().filter(|c| !c.deleted);
        let Some(first) = live.next() else {
            return Ok(VersionVector::new());
        };
        let mut v = first.version;
        for c in live {
            v.downgrade(&c.version);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::{MemoryStore, Store};

    fn vv(entries: &[(u64, u64)]) -> VersionVector {
        VersionVector::from_entries(entries.iter().copied())
    }

    #[test]
    fn test_increment_creates_and_counts() {
        let cps = Checkpoints::new();
        let store = MemoryStore::new();
        store.update(|tx| cps.increment(tx, 1)).unwrap();
        let c = store.update(|tx| cps.increment(tx, 1)).unwrap();
        assert_eq!(c.id, 1);
        assert_eq!(c.local_version(), 2);
    }

    #[test]
    fn test_merge_never_regresses() {
        let cps = Checkpoints::new();
        let store = MemoryStore::new();
        store
            .update(|tx| cps.merge(tx, Checkpoint::new(2, vv(&[(1, 4), (2, 7)]))))
            .unwrap();
        let c = store
            .update(|tx| cps.merge(tx, Checkpoint::new(2, vv(&[(1, 5), (2, 3)]))))
            .unwrap();
        assert_eq!(c.version.get(1), 5);
        assert_eq!(c.version.get(2), 7);
    }

    #[test]
    fn test_direct_table_write_is_merged() {
        let cps = Checkpoints::new();
        let store = MemoryStore::new();
        store
            .update(|tx| cps.merge(tx, Checkpoint::new(3, vv(&[(3, 9)]))))
            .unwrap();
        let c = store
            .update(|tx| cps.table().upsert(tx, Checkpoint::new(3, vv(&[(3, 1)]))))
            .unwrap();
        assert_eq!(c.version.get(3), 9);
    }

    #[test]
    fn test_min_version_ignores_deleted() {
        let cps = Checkpoints::new();
        let store = MemoryStore::new();
        store
            .update(|tx| {
                cps.merge(tx, Checkpoint::new(1, vv(&[(1, 5), (2, 2)])))?;
                cps.merge(tx, Checkpoint::new(2, vv(&[(1, 3), (2, 4)])))?;
                cps.merge(tx, Checkpoint::new(3, vv(&[(1, 1), (2, 1)])))
            })
            .unwrap();
        assert_eq!(
            store.view(|tx| cps.min_version(tx)).unwrap(),
            vv(&[(1, 1), (2, 1)])
        );

        store.update(|tx| cps.mark_deleted(tx, 3)).unwrap();
        assert_eq!(
            store.view(|tx| cps.min_version(tx)).unwrap(),
            vv(&[(1, 3), (2, 2)])
        );
        assert!(store.view(|tx| cps.get(tx, 3)).unwrap().unwrap().deleted);
    }
}
