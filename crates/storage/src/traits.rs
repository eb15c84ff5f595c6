//! Transaction and store traits
//!
//! Every component above the backing store is implemented purely in terms
//! of four operations: `get`, `put`, `delete` and `scan_prefix`. Stores run
//! a caller closure inside one transaction; returning `Err` from the closure
//! discards every write it made.

use std::any::Any;
use tessera_core::Result;

/// Read access inside a transaction
pub trait ReadTx {
    /// Value stored at `key`, `None` when absent
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Values of every key starting with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>>;

    /// Store-wide salt mixed into hashed index keys
    fn salt(&self) -> Option<&[u8]> {
        None
    }
}

/// Read/write access inside a transaction
pub trait WriteTx: ReadTx {
    /// Write `value` at `key`, replacing any previous value
    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    fn delete(&mut self, key: &str) -> Result<()>;

    /// This transaction as a read-only handle
    fn as_read(&self) -> &dyn ReadTx;

    /// Per-transaction state attached by a wrapping layer
    ///
    /// Hooks use this to reach state owned by whoever opened the
    /// transaction (for example pending replication events) without a
    /// process-wide registry. Plain stores have none.
    fn extension_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// A transactional blob store
///
/// Writers are serialized by the store. A failed `update` leaves the store
/// exactly as it was.
pub trait Store: Send + Sync {
    /// Run `f` in a read-only transaction
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T>) -> Result<T>;

    /// Run `f` in a read/write transaction, committing when it returns `Ok`
    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T>) -> Result<T>;
}

impl<S: Store> Store for std::sync::Arc<S> {
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T>) -> Result<T> {
        (**self).view(f)
    }

    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T>) -> Result<T> {
        (**self).update(f)
    }
}
