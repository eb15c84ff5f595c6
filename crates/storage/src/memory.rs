//! MemoryStore: in-memory backing store
//!
//! - `BTreeMap<String, Vec<u8>>` behind a `parking_lot::RwLock` for ordered
//!   keys and prefix scans
//! - a writer mutex so at most one `update` transaction runs at a time
//! - each write transaction buffers its writes in an overlay map that is
//!   applied in one batch on commit and dropped on error
//!
//! Readers only contend with a committing writer for the duration of the
//! batch apply, never for the duration of a write transaction.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tessera_core::{Error, Result};
use tracing::debug;

use crate::traits::{ReadTx, Store, WriteTx};

/// Salts longer than this are truncated when used for index hashing.
pub const MAX_SALT_LEN: usize = 64;

/// In-memory transactional store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    writer: Mutex<()>,
    salt: Option<Vec<u8>>,
    read_only: AtomicBool,
    commits: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store without a salt
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store whose transactions expose `salt`
    pub fn with_salt(salt: impl Into<Vec<u8>>) -> Self {
        let mut salt = salt.into();
        salt.truncate(MAX_SALT_LEN);
        Self {
            salt: Some(salt),
            ..Self::default()
        }
    }

    /// Reject further `update` transactions with `Error::ReadOnly`
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Number of committed write transactions that changed something
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Copy of every key/value pair whose key starts with `prefix`
    pub fn snapshot(&self, prefix: &str) -> BTreeMap<String, Vec<u8>> {
        scan_range(&self.data.read(), prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn commit(&self, overlay: BTreeMap<String, Option<Vec<u8>>>) {
        if overlay.is_empty() {
            return;
        }
        let mut data = self.data.write();
        let mut puts = 0usize;
        let mut deletes = 0usize;
        for (key, value) in overlay {
            match value {
                Some(v) => {
                    data.insert(key, v);
                    puts += 1;
                }
                None => {
                    data.remove(&key);
                    deletes += 1;
                }
            }
        }
        self.commits.fetch_add(1, Ordering::AcqRel);
        debug!(puts, deletes, "memory store commit");
    }
}

fn scan_range<'a>(
    data: &'a BTreeMap<String, Vec<u8>>,
    prefix: &str,
) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
    let prefix = prefix.to_string();
    data.range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(prefix.as_str()))
}

impl Store for MemoryStore {
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T>) -> Result<T> {
        let tx = MemoryReadTx {
            data: &self.data,
            salt: self.salt.as_deref(),
        };
        f(&tx)
    }

    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T>) -> Result<T> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        let _writer = self.writer.lock();
        let start = Instant::now();

        let mut tx = MemoryWriteTx {
            data: &self.data,
            salt: self.salt.as_deref(),
            overlay: BTreeMap::new(),
        };
        match f(&mut tx) {
            Ok(out) => {
                self.commit(tx.overlay);
                debug!(elapsed_us = start.elapsed().as_micros() as u64, "update committed");
                Ok(out)
            }
            Err(e) => {
                debug!(error = %e, "update rolled back");
                Err(e)
            }
        }
    }
}

struct MemoryReadTx<'a> {
    data: &'a RwLock<BTreeMap<String, Vec<u8>>>,
    salt: Option<&'a [u8]>,
}

impl ReadTx for MemoryReadTx<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        Ok(scan_range(&self.data.read(), prefix)
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn salt(&self) -> Option<&[u8]> {
        self.salt
    }
}

struct MemoryWriteTx<'a> {
    data: &'a RwLock<BTreeMap<String, Vec<u8>>>,
    salt: Option<&'a [u8]>,
    /// `None` marks a pending delete
    overlay: BTreeMap<String, Option<Vec<u8>>>,
}

impl ReadTx for MemoryWriteTx<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.overlay.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let mut merged: BTreeMap<String, Vec<u8>> = scan_range(&self.data.read(), prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let pending = self
            .overlay
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix));
        for (key, value) in pending {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    fn salt(&self) -> Option<&[u8]> {
        self.salt
    }
}

impl WriteTx for MemoryWriteTx<'_> {
    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.overlay.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.overlay.insert(key.to_string(), None);
        Ok(())
    }

    fn as_read(&self) -> &dyn ReadTx {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_put_get_commit() {
        let store = MemoryStore::new();
        store
            .update(|tx| tx.put("1:a", b"one".to_vec()))
            .unwrap();
        let v = store.view(|tx| tx.get("1:a")).unwrap();
        assert_eq!(v, Some(b"one".to_vec()));
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_error_discards_writes() {
        let store = MemoryStore::new();
        let result: Result<()> = store.update(|tx| {
            tx.put("1:a", b"one".to_vec())?;
            Err(Error::InvalidOperation("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn test_read_your_writes() {
        let store = MemoryStore::new();
        store.update(|tx| tx.put("1:a", b"base".to_vec())).unwrap();
        store
            .update(|tx| {
                tx.put("1:b", b"new".to_vec())?;
                tx.delete("1:a")?;
                assert_eq!(tx.get("1:a")?, None);
                assert_eq!(tx.get("1:b")?, Some(b"new".to_vec()));
                assert_eq!(tx.scan_prefix("1:")?, vec![b"new".to_vec()]);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store
            .update(|tx| {
                tx.put("2:b", b"b".to_vec())?;
                tx.put("2:a", b"a".to_vec())?;
                tx.put("20:a", b"x".to_vec())?;
                tx.put("1:z", b"z".to_vec())
            })
            .unwrap();
        let values = store.view(|tx| tx.scan_prefix("2:")).unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let store = MemoryStore::new();
        store.update(|tx| tx.delete("1:missing")).unwrap();
    }

    #[test]
    fn test_salt_truncated() {
        let store = MemoryStore::with_salt(vec![7u8; 100]);
        let len = store.view(|tx| Ok(tx.salt().map(|s| s.len()))).unwrap();
        assert_eq!(len, Some(MAX_SALT_LEN));
        assert!(MemoryStore::new().view(|tx| Ok(tx.salt().is_none())).unwrap());
    }

    #[test]
    fn test_read_only_rejects_update() {
        let store = MemoryStore::new();
        store.set_read_only(true);
        assert!(matches!(
            store.update(|tx| tx.put("1:a", vec![])),
            Err(Error::ReadOnly)
        ));
        store.set_read_only(false);
        store.update(|tx| tx.put("1:a", vec![])).unwrap();
    }

    #[test]
    fn test_snapshot_by_prefix() {
        let store = MemoryStore::new();
        store
            .update(|tx| {
                tx.put("3:a", b"a".to_vec())?;
                tx.put("4:a", b"b".to_vec())
            })
            .unwrap();
        let snap = store.snapshot("3:");
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("3:a"), Some(&b"a".to_vec()));
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..50 {
                        store
                            .update(|tx| {
                                let n = tx
                                    .get("0:counter")?
                                    .map(|b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
                                    .unwrap_or(0);
                                tx.put("0:counter", (n + 1).to_le_bytes().to_vec())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let bytes = store.view(|tx| tx.get("0:counter")).unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 400);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, u8),
        Delete(u8),
        Abort,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
            (0u8..8).prop_map(Op::Delete),
            Just(Op::Abort),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_model(batches in prop::collection::vec(prop::collection::vec(arb_op(), 1..6), 1..10)) {
            let store = MemoryStore::new();
            let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

            for batch in batches {
                let mut staged = model.clone();
                let aborted = batch.iter().any(|op| matches!(op, Op::Abort));
                let result = store.update(|tx| {
                    for op in &batch {
                        match op {
                            Op::Put(k, v) => {
                                let key = format!("9:{:02x}", k);
                                tx.put(&key, vec![*v])?;
                                staged.insert(key, vec![*v]);
                            }
                            Op::Delete(k) => {
                                let key = format!("9:{:02x}", k);
                                tx.delete(&key)?;
                                staged.remove(&key);
                            }
                            Op::Abort => return Err(Error::InvalidOperation("abort".into())),
                        }
                    }
                    Ok(())
                });
                prop_assert_eq!(result.is_err(), aborted);
                if !aborted {
                    model = staged;
                }
                prop_assert_eq!(store.snapshot("9:"), model.clone());
            }
        }
    }
}
