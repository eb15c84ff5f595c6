//! Table: typed CRUD over the backing store
//!
//! ## Design
//!
//! A `Table<T>` is a cheap, cloneable handle to one namespaced collection of
//! records. It holds no record data, only the namespace and the ordered
//! lists of set and delete hooks attached to it. Every operation runs inside
//! a transaction supplied by the caller, so several tables (and their hooks)
//! can be mutated atomically.
//!
//! ## Hooks
//!
//! - set hooks run on `insert`, `update`, `upsert` and `transform` with
//!   `(tx, new, previous)` before the record is written; they may rewrite
//!   the new value (replication stamps its version vector this way)
//! - delete hooks run on `delete` with the stored record before the key is
//!   removed
//!
//! Hooks run in registration order. A failing hook fails the operation and,
//! through the caller's transaction, discards every write made so far.
//!
//! A write whose new value equals the stored value is skipped entirely:
//! no hooks run and nothing is written.
//!
//! ## Key Design
//!
//! - Record key: `<namespace>:<id as 16 hex digits>`

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tessera_core::{decode, encode, Error, Namespace, Record, Result};
use tessera_storage::{ReadTx, WriteTx};
use tracing::debug;

/// Set hook: `(tx, new, previous)`
pub type SetHook<T> =
    Arc<dyn Fn(&mut dyn WriteTx, &mut T, Option<&T>) -> Result<()> + Send + Sync>;

/// Delete hook: `(tx, deleted)`
pub type DeleteHook<T> = Arc<dyn Fn(&mut dyn WriteTx, &T) -> Result<()> + Send + Sync>;

/// Read and decode the value at `key`
pub fn load<V, R>(tx: &R, key: &str) -> Result<V>
where
    V: DeserializeOwned,
    R: ReadTx + ?Sized,
{
    match tx.get(key)? {
        Some(bytes) => decode(&bytes),
        None => Err(Error::not_found(key)),
    }
}

/// Read and decode the value at `key`, `None` when absent
pub fn try_load<V, R>(tx: &R, key: &str) -> Result<Option<V>>
where
    V: DeserializeOwned,
    R: ReadTx + ?Sized,
{
    tx.get(key)?.map(|bytes| decode(&bytes)).transpose()
}

struct TableInner<T> {
    ns: Namespace,
    set_hooks: RwLock<Vec<SetHook<T>>>,
    delete_hooks: RwLock<Vec<DeleteHook<T>>>,
}

/// Typed collection of records keyed by `(namespace, id)`
pub struct Table<T: Record> {
    inner: Arc<TableInner<T>>,
}

impl<T: Record> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Record> std::fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("type", &Self::type_name())
            .field("ns", &self.inner.ns)
            .finish()
    }
}

/// Non-owning handle to a table, for hooks that refer back to their own table
pub struct WeakTable<T: Record> {
    inner: Weak<TableInner<T>>,
}

impl<T: Record> Clone for WeakTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Record> WeakTable<T> {
    /// Recover the table while any strong handle is alive
    pub fn upgrade(&self) -> Option<Table<T>> {
        self.inner.upgrade().map(|inner| Table { inner })
    }
}

impl<T: Record> Table<T> {
    /// Create a table over namespace `ns` with no hooks
    pub fn new(ns: Namespace) -> Self {
        Self {
            inner: Arc::new(TableInner {
                ns,
                set_hooks: RwLock::new(Vec::new()),
                delete_hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Namespace of the table
    pub fn namespace(&self) -> Namespace {
        self.inner.ns
    }

    /// Store key of record `id`
    pub fn key(&self, id: u64) -> String {
        self.inner.ns.format(id)
    }

    /// Non-owning handle to this table
    pub fn downgrade(&self) -> WeakTable<T> {
        WeakTable {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    /// Append a set hook
    pub fn on_set<F>(&self, hook: F)
    where
        F: Fn(&mut dyn WriteTx, &mut T, Option<&T>) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.set_hooks.write().push(Arc::new(hook));
    }

    /// Append a delete hook
    pub fn on_delete<F>(&self, hook: F)
    where
        F: Fn(&mut dyn WriteTx, &T) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.delete_hooks.write().push(Arc::new(hook));
    }

    fn trace<V>(&self, op: &'static str, id: Option<u64>, start: Instant, result: &Result<V>) {
        debug!(
            target: "tessera::table",
            record_type = Self::type_name(),
            ns = %self.inner.ns,
            id = ?id,
            elapsed_us = start.elapsed().as_micros() as u64,
            error = ?result.as_ref().err(),
            "Table::{}", op
        );
    }

    /// Load record `id`
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when no record has that id.
    pub fn get<R: ReadTx + ?Sized>(&self, tx: &R, id: u64) -> Result<T> {
        let start = Instant::now();
        let result = load(tx, &self.key(id));
        self.trace("get", Some(id), start, &result);
        result
    }

    /// Load record `id`, `None` when absent
    pub fn try_get<R: ReadTx + ?Sized>(&self, tx: &R, id: u64) -> Result<Option<T>> {
        try_load(tx, &self.key(id))
    }

    /// Load every record, in id order
    pub fn get_all<R: ReadTx + ?Sized>(&self, tx: &R) -> Result<Vec<T>> {
        let start = Instant::now();
        let result = tx
            .scan_prefix(&self.inner.ns.format_prefix())
            .and_then(|values| values.iter().map(|v| decode(v)).collect());
        self.trace("get_all", None, start, &result);
        result
    }

    /// Insert a new record
    ///
    /// # Errors
    ///
    /// `RecordExists` when a record with the same id exists, or any error
    /// raised by a set hook.
    pub fn insert(&self, tx: &mut dyn WriteTx, value: T) -> Result<T> {
        let start = Instant::now();
        let id = value.id();
        let result = match tx.get(&self.key(id)) {
            Ok(Some(_)) => Err(Error::RecordExists { key: self.key(id) }),
            Ok(None) => self.write(tx, value, None),
            Err(e) => Err(e),
        };
        self.trace("insert", Some(id), start, &result);
        result
    }

    /// Replace an existing record
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when no record has the value's id.
    pub fn update(&self, tx: &mut dyn WriteTx, value: T) -> Result<T> {
        let start = Instant::now();
        let id = value.id();
        let result = self
            .get(&*tx, id)
            .and_then(|prev| self.write_changed(tx, value, Some(prev)));
        self.trace("update", Some(id), start, &result);
        result
    }

    /// Insert or replace a record
    pub fn upsert(&self, tx: &mut dyn WriteTx, value: T) -> Result<T> {
        let start = Instant::now();
        let id = value.id();
        let result = self
            .try_get(&*tx, id)
            .and_then(|prev| self.write_changed(tx, value, prev));
        self.trace("upsert", Some(id), start, &result);
        result
    }

    /// Read-modify-write of an existing record
    ///
    /// `f` receives a copy of the stored record; the copy is written back if
    /// `f` changed it. `f` must not change the record's id.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when no record has that id, or whatever `f` returns.
    pub fn transform<F>(&self, tx: &mut dyn WriteTx, id: u64, f: F) -> Result<T>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let start = Instant::now();
        let result = self
            .get(&*tx, id)
            .and_then(|prev| self.apply(tx, id, Some(prev), f));
        self.trace("transform", Some(id), start, &result);
        result
    }

    /// Read-modify-write starting from `T::default()` when the record is absent
    ///
    /// `f` must leave the record's id equal to `id`.
    pub fn transform_or_default<F>(&self, tx: &mut dyn WriteTx, id: u64, f: F) -> Result<T>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let start = Instant::now();
        let result = self
            .try_get(&*tx, id)
            .and_then(|prev| self.apply(tx, id, prev, f));
        self.trace("transform", Some(id), start, &result);
        result
    }

    /// Delete record `id`, returning the removed record
    ///
    /// Delete hooks run with the stored record before the key is removed.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when no record has that id.
    pub fn delete(&self, tx: &mut dyn WriteTx, id: u64) -> Result<T> {
        let start = Instant::now();
        let result = self.get(&*tx, id).and_then(|prev| {
            let hooks: Vec<DeleteHook<T>> = self.inner.delete_hooks.read().clone();
            for hook in hooks {
                hook(tx, &prev)?;
            }
            tx.delete(&self.key(id))?;
            Ok(prev)
        });
        self.trace("delete", Some(id), start, &result);
        result
    }

    fn apply<F>(&self, tx: &mut dyn WriteTx, id: u64, prev: Option<T>, f: F) -> Result<T>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let mut next = prev.clone().unwrap_or_default();
        f(&mut next)?;
        if next.id() != id {
            return Err(Error::InvalidOperation(format!(
                "transform changed record id {} to {}",
                id,
                next.id()
            )));
        }
        self.write_changed(tx, next, prev)
    }

    fn write_changed(&self, tx: &mut dyn WriteTx, value: T, prev: Option<T>) -> Result<T> {
        match prev {
            Some(prev) if prev == value => Ok(prev),
            prev => self.write(tx, value, prev.as_ref()),
        }
    }

    fn write(&self, tx: &mut dyn WriteTx, mut value: T, prev: Option<&T>) -> Result<T> {
        let hooks: Vec<SetHook<T>> = self.inner.set_hooks.read().clone();
        for hook in hooks {
            hook(tx, &mut value, prev)?;
        }
        tx.put(&self.key(value.id()), encode(&value)?)?;
        Ok(value)
    }
}
