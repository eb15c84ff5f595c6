//! Secondary indexes built from table hooks
//!
//! ## Key Design
//!
//! - Index entry key: `<index ns>:<base64(sha256(salt || key))>:<id as 16 hex digits>`
//! - Index entry value: `{key, id}` with the raw key bytes
//!
//! The raw key is stored alongside the id and compared on every scan, so a
//! hash collision between two keys shows up as a mismatch and is filtered
//! out rather than returning a foreign id.
//!
//! The salt comes from the backing store (`ReadTx::salt`) and is truncated
//! to 64 bytes.

use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::{decode, encode, Namespace, Record, Result};
use tessera_storage::{ReadTx, WriteTx};
use tracing::debug;

use crate::table::Table;

/// Salt bytes mixed into index key hashes; longer salts are truncated
pub const MAX_SALT_LEN: usize = 64;

/// Conversion of an index key into the bytes that get hashed and stored
pub trait IndexKey {
    /// Raw key bytes
    fn index_key(&self) -> Vec<u8>;
}

impl IndexKey for u64 {
    fn index_key(&self) -> Vec<u8> {
        let mut b = vec![0u8; 8];
        LittleEndian::write_u64(&mut b, *self);
        b
    }
}

impl IndexKey for str {
    fn index_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl IndexKey for String {
    fn index_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl IndexKey for [u8] {
    fn index_key(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl IndexKey for Vec<u8> {
    fn index_key(&self) -> Vec<u8> {
        self.clone()
    }
}

impl<K: IndexKey + ?Sized> IndexKey for &K {
    fn index_key(&self) -> Vec<u8> {
        (**self).index_key()
    }
}

/// Stored value of one index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Raw key bytes
    pub key: Vec<u8>,
    /// Indexed record id
    pub id: u64,
}

/// Salted, fixed-length digest of `key`
pub fn hash_key(salt: Option<&[u8]>, key: &[u8]) -> String {
    let mut h = Sha256::new();
    if let Some(salt) = salt {
        h.update(&salt[..salt.len().min(MAX_SALT_LEN)]);
    }
    h.update(key);
    STANDARD_NO_PAD.encode(h.finalize())
}

fn entry_prefix(ns: Namespace, salt: Option<&[u8]>, key: &[u8]) -> String {
    format!("{}{}:", ns.format_prefix(), hash_key(salt, key))
}

fn entry_key(ns: Namespace, salt: Option<&[u8]>, key: &[u8], id: u64) -> String {
    format!("{}{:016x}", entry_prefix(ns, salt, key), id)
}

/// Write the entry mapping `key` to `id`
pub fn set_index(tx: &mut dyn WriteTx, ns: Namespace, key: &[u8], id: u64) -> Result<()> {
    let k = entry_key(ns, tx.salt(), key, id);
    let entry = IndexEntry {
        key: key.to_vec(),
        id,
    };
    tx.put(&k, encode(&entry)?)
}

/// Remove the entry mapping `key` to `id`
pub fn delete_index(tx: &mut dyn WriteTx, ns: Namespace, key: &[u8], id: u64) -> Result<()> {
    let k = entry_key(ns, tx.salt(), key, id);
    tx.delete(&k)
}

/// Ids indexed under `key`, in id order
///
/// Entries whose stored raw key differs from `key` (hash collisions) are
/// skipped.
pub fn scan_index<R: ReadTx + ?Sized>(tx: &R, ns: Namespace, key: &[u8]) -> Result<Vec<u64>> {
    let prefix = entry_prefix(ns, tx.salt(), key);
    let mut ids = Vec::new();
    for bytes in tx.scan_prefix(&prefix)? {
        let entry: IndexEntry = decode(&bytes)?;
        if entry.key == key {
            ids.push(entry.id);
        }
    }
    Ok(ids)
}

/// Remove every entry of index `ns`, returning how many were removed
pub fn purge_index(tx: &mut dyn WriteTx, ns: Namespace) -> Result<usize> {
    let entries = tx.scan_prefix(&ns.format_prefix())?;
    let n = entries.len();
    for bytes in entries {
        let entry: IndexEntry = decode(&bytes)?;
        delete_index(tx, ns, &entry.key, entry.id)?;
    }
    Ok(n)
}

/// Key extractor
pub type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

/// Predicate selecting which records get indexed
pub type Condition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Options of a secondary index
pub struct SecondaryIndexOptions<T> {
    /// Records failing the predicate are not indexed
    pub condition: Option<Condition<T>>,
}

impl<T> Default for SecondaryIndexOptions<T> {
    fn default() -> Self {
        Self { condition: None }
    }
}

impl<T> SecondaryIndexOptions<T> {
    /// Only index records for which `f` returns true
    pub fn condition(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(f));
        self
    }
}

pub(crate) fn passes<T>(condition: &Option<Condition<T>>, value: &T) -> bool {
    condition.as_ref().map_or(true, |c| c(value))
}

struct IndexInner<T: Record, K> {
    ns: Namespace,
    table: Table<T>,
    key: KeyFn<T, K>,
    condition: Option<Condition<T>>,
}

/// Index from a derived key to the ids of every record producing it
pub struct SecondaryIndex<T: Record, K> {
    inner: Arc<IndexInner<T, K>>,
}

impl<T: Record, K> Clone for SecondaryIndex<T, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, K> SecondaryIndex<T, K>
where
    T: Record,
    K: IndexKey + 'static,
{
    /// Index every record of `table` under `key(record)`
    pub fn new(ns: Namespace, table: &Table<T>, key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Self::with_options(ns, table, key, SecondaryIndexOptions::default())
    }

    /// Index `table` with explicit options
    pub fn with_options(
        ns: Namespace,
        table: &Table<T>,
        key: impl Fn(&T) -> K + Send + Sync + 'static,
        options: SecondaryIndexOptions<T>,
    ) -> Self {
        Self::from_parts(ns, table, Arc::new(key), options.condition)
    }

    pub(crate) fn from_parts(
        ns: Namespace,
        table: &Table<T>,
        key: KeyFn<T, K>,
        condition: Option<Condition<T>>,
    ) -> Self {
        {
            let key = Arc::clone(&key);
            table.on_delete(move |tx, m| {
                let start = Instant::now();
                let result = delete_index(tx, ns, &key(m).index_key(), m.id());
                debug!(
                    target: "tessera::index",
                    ns = %ns,
                    id = m.id(),
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "SecondaryIndex delete hook"
                );
                result
            });
        }
        {
            let key = Arc::clone(&key);
            let condition = condition.clone();
            table.on_set(move |tx, m, p| {
                let mc = passes(&condition, m);
                let mk = key(m).index_key();
                if let Some(p) = p {
                    let pc = passes(&condition, p);
                    let pk = key(p).index_key();
                    if mk == pk && mc == pc {
                        return Ok(());
                    }
                    if pc {
                        delete_index(tx, ns, &pk, p.id())?;
                    }
                }
                if !mc {
                    return Ok(());
                }
                debug!(target: "tessera::index", ns = %ns, id = m.id(), "SecondaryIndex set hook");
                set_index(tx, ns, &mk, m.id())
            });
        }

        Self {
            inner: Arc::new(IndexInner {
                ns,
                table: table.clone(),
                key,
                condition,
            }),
        }
    }

    /// Namespace of the index entries
    pub fn namespace(&self) -> Namespace {
        self.inner.ns
    }

    /// Indexed table
    pub fn table(&self) -> &Table<T> {
        &self.inner.table
    }

    /// Key a record is indexed under
    pub fn key_of(&self, value: &T) -> K {
        (self.inner.key)(value)
    }

    /// True when `value` passes the index condition
    pub fn indexes(&self, value: &T) -> bool {
        passes(&self.inner.condition, value)
    }

    /// Every record indexed under `key`
    pub fn get_all<R, Q>(&self, tx: &R, key: &Q) -> Result<Vec<T>>
    where
        R: ReadTx + ?Sized,
        Q: IndexKey + ?Sized,
    {
        let start = Instant::now();
        let ids = scan_index(tx, self.inner.ns, &key.index_key())?;
        let result: Result<Vec<T>> = ids.iter().map(|id| self.inner.table.get(tx, *id)).collect();
        debug!(
            target: "tessera::index",
            ns = %self.inner.ns,
            records = ids.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "SecondaryIndex::get_all"
        );
        result
    }

    /// Ids of every record indexed under `key`
    pub fn get_all_ids<R, Q>(&self, tx: &R, key: &Q) -> Result<Vec<u64>>
    where
        R: ReadTx + ?Sized,
        Q: IndexKey + ?Sized,
    {
        scan_index(tx, self.inner.ns, &key.index_key())
    }

    /// Number of records indexed under `key`
    pub fn count<R, Q>(&self, tx: &R, key: &Q) -> Result<usize>
    where
        R: ReadTx + ?Sized,
        Q: IndexKey + ?Sized,
    {
        Ok(self.get_all_ids(tx, key)?.len())
    }

    /// Delete every record indexed under `key`, returning their ids
    pub fn delete_all<Q>(&self, tx: &mut dyn WriteTx, key: &Q) -> Result<Vec<u64>>
    where
        Q: IndexKey + ?Sized,
    {
        let ids = scan_index(&*tx, self.inner.ns, &key.index_key())?;
        for id in &ids {
            self.inner.table.delete(tx, *id)?;
        }
        debug!(
            target: "tessera::index",
            ns = %self.inner.ns,
            records = ids.len(),
            "SecondaryIndex::delete_all"
        );
        Ok(ids)
    }

    /// Drop every entry and re-index the whole table
    pub fn rebuild(&self, tx: &mut dyn WriteTx) -> Result<()> {
        let purged = purge_index(tx, self.inner.ns)?;
        let mut indexed = 0usize;
        for m in self.inner.table.get_all(&*tx)? {
            if !self.indexes(&m) {
                continue;
            }
            set_index(tx, self.inner.ns, &self.key_of(&m).index_key(), m.id())?;
            indexed += 1;
        }
        debug!(target: "tessera::index", ns = %self.inner.ns, purged, indexed, "SecondaryIndex::rebuild");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::{MemoryStore, Store};

    #[test]
    fn test_hash_key_depends_on_salt() {
        let a = hash_key(None, b"k");
        let b = hash_key(Some(b"salt"), b"k");
        assert_ne!(a, b);
        assert_eq!(a, hash_key(None, b"k"));
        assert!(!a.contains(':'));
    }

    #[test]
    fn test_hash_key_salt_truncated() {
        let long = vec![1u8; 100];
        assert_eq!(
            hash_key(Some(&long), b"k"),
            hash_key(Some(&long[..MAX_SALT_LEN]), b"k")
        );
    }

    #[test]
    fn test_u64_key_is_little_endian() {
        assert_eq!(1u64.index_key(), vec![1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_set_scan_delete() {
        let store = MemoryStore::new();
        let ns = Namespace::new(40);
        store
            .update(|tx| {
                set_index(tx, ns, b"red", 2)?;
                set_index(tx, ns, b"red", 1)?;
                set_index(tx, ns, b"blue", 3)
            })
            .unwrap();
        assert_eq!(store.view(|tx| scan_index(tx, ns, b"red")).unwrap(), vec![1, 2]);

        store.update(|tx| delete_index(tx, ns, b"red", 1)).unwrap();
        assert_eq!(store.view(|tx| scan_index(tx, ns, b"red")).unwrap(), vec![2]);
        assert_eq!(store.view(|tx| scan_index(tx, ns, b"blue")).unwrap(), vec![3]);
    }

    #[test]
    fn test_scan_rejects_colliding_entry() {
        let store = MemoryStore::new();
        let ns = Namespace::new(40);
        // Forge an entry under the hash of "red" carrying a different raw key
        let forged = format!("{}{:016x}", entry_prefix(ns, None, b"red"), 9);
        let value = encode(&IndexEntry {
            key: b"green".to_vec(),
            id: 9,
        })
        .unwrap();
        store
            .update(|tx| {
                set_index(tx, ns, b"red", 1)?;
                tx.put(&forged, value)
            })
            .unwrap();
        assert_eq!(store.view(|tx| scan_index(tx, ns, b"red")).unwrap(), vec![1]);
    }

    #[test]
    fn test_salted_store_changes_entry_keys() {
        let plain = MemoryStore::new();
        let salted = MemoryStore::with_salt(b"pepper".to_vec());
        let ns = Namespace::new(40);
        plain.update(|tx| set_index(tx, ns, b"k", 1)).unwrap();
        salted.update(|tx| set_index(tx, ns, b"k", 1)).unwrap();
        assert_ne!(
            plain.snapshot("").keys().collect::<Vec<_>>(),
            salted.snapshot("").keys().collect::<Vec<_>>()
        );
        assert_eq!(salted.view(|tx| scan_index(tx, ns, b"k")).unwrap(), vec![1]);
    }

    #[test]
    fn test_purge() {
        let store = MemoryStore::new();
        let ns = Namespace::new(40);
        let other = Namespace::new(41);
        store
            .update(|tx| {
                set_index(tx, ns, b"a", 1)?;
                set_index(tx, ns, b"b", 2)?;
                set_index(tx, other, b"a", 1)
            })
            .unwrap();
        let n = store.update(|tx| purge_index(tx, ns)).unwrap();
        assert_eq!(n, 2);
        assert!(store.snapshot(&ns.format_prefix()).is_empty());
        assert_eq!(store.snapshot(&other.format_prefix()).len(), 1);
    }
}
