//! Singleton: a table holding at most one record
//!
//! The record lives at the bare namespace key (`<namespace>`), outside the
//! `<namespace>:` prefix used by table records. `get` falls back to a
//! configured default when nothing has been stored.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tessera_core::{encode, Namespace, Result, Stored};
use tessera_storage::{ReadTx, WriteTx};
use tracing::debug;

use crate::table::{load, try_load, SetHook};

struct SingletonInner<T> {
    ns: Namespace,
    default_value: Option<T>,
    set_hooks: RwLock<Vec<SetHook<T>>>,
}

/// Typed single-value slot in one namespace
pub struct Singleton<T: Stored> {
    inner: Arc<SingletonInner<T>>,
}

impl<T: Stored> Clone for Singleton<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Stored> Singleton<T> {
    /// Create a singleton without a default value
    pub fn new(ns: Namespace) -> Self {
        Self::build(ns, None)
    }

    /// Create a singleton whose `get` returns `default_value` while unset
    pub fn with_default(ns: Namespace, default_value: T) -> Self {
        Self::build(ns, Some(default_value))
    }

    fn build(ns: Namespace, default_value: Option<T>) -> Self {
        Self {
            inner: Arc::new(SingletonInner {
                ns,
                default_value,
                set_hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Namespace of the singleton
    pub fn namespace(&self) -> Namespace {
        self.inner.ns
    }

    /// Append a set hook
    pub fn on_set<F>(&self, hook: F)
    where
        F: Fn(&mut dyn WriteTx, &mut T, Option<&T>) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.set_hooks.write().push(Arc::new(hook));
    }

    fn key(&self) -> String {
        self.inner.ns.singleton_key()
    }

    /// Stored value, or a clone of the default
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when unset and no default was configured.
    pub fn get<R: ReadTx + ?Sized>(&self, tx: &R) -> Result<T> {
        match load(tx, &self.key()) {
            Err(e) if e.is_not_found() => self.inner.default_value.clone().ok_or(e),
            other => other,
        }
    }

    /// Stored value, `None` when unset (the default is not consulted)
    pub fn try_get<R: ReadTx + ?Sized>(&self, tx: &R) -> Result<Option<T>> {
        try_load(tx, &self.key())
    }

    /// Replace the stored value
    pub fn set(&self, tx: &mut dyn WriteTx, value: T) -> Result<T> {
        let start = Instant::now();
        let result = self
            .try_get(&*tx)
            .and_then(|prev| self.write_changed(tx, value, prev));
        self.trace("set", start, &result);
        result
    }

    /// Read-modify-write; `f` starts from the stored value, the default, or
    /// `T::default()`, in that order
    pub fn transform<F>(&self, tx: &mut dyn WriteTx, f: F) -> Result<T>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let start = Instant::now();
        let result = self.try_get(&*tx).and_then(|prev| {
            let mut next = match &prev {
                Some(p) => p.clone(),
                None => self.inner.default_value.clone().unwrap_or_default(),
            };
            f(&mut next)?;
            self.write_changed(tx, next, prev)
        });
        self.trace("transform", start, &result);
        result
    }

    /// Remove the stored value; a later `get` returns the default again
    ///
    /// Local only: no hooks run, so a replicated singleton keeps its value
    /// on peers and the next `set` here is ordered against that value.
    pub fn clear(&self, tx: &mut dyn WriteTx) -> Result<()> {
        tx.delete(&self.key())
    }

    fn write_changed(&self, tx: &mut dyn WriteTx, mut value: T, prev: Option<T>) -> Result<T> {
        if let Some(p) = &prev {
            if *p == value {
                return Ok(value);
            }
        }
        let hooks: Vec<SetHook<T>> = self.inner.set_hooks.read().clone();
        for hook in hooks {
            hook(tx, &mut value, prev.as_ref())?;
        }
        tx.put(&self.key(), encode(&value)?)?;
        Ok(value)
    }

    fn trace<V>(&self, op: &'static str, start: Instant, result: &Result<V>) {
        debug!(
            target: "tessera::singleton",
            record_type = std::any::type_name::<T>(),
            ns = %self.inner.ns,
            elapsed_us = start.elapsed().as_micros() as u64,
            error = ?result.as_ref().err(),
            "Singleton::{}", op
        );
    }
}

impl<T: Stored> std::fmt::Debug for Singleton<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Singleton")
            .field("type", &std::any::type_name::<T>())
            .field("ns", &self.inner.ns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessera_core::Error;
    use tessera_storage::{MemoryStore, Store};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        volume: u8,
    }

    #[test]
    fn test_get_unset_without_default() {
        let store = MemoryStore::new();
        let s: Singleton<Settings> = Singleton::new(Namespace::new(30));
        assert!(store.view(|tx| s.get(tx)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_returns_default_copy() {
        let store = MemoryStore::new();
        let default = Settings {
            theme: "dark".into(),
            volume: 5,
        };
        let s = Singleton::with_default(Namespace::new(30), default.clone());
        assert_eq!(store.view(|tx| s.get(tx)).unwrap(), default);
        assert_eq!(store.view(|tx| s.try_get(tx)).unwrap(), None);
    }

    #[test]
    fn test_set_and_clear() {
        let store = MemoryStore::new();
        let s = Singleton::with_default(Namespace::new(30), Settings::default());
        let v = Settings {
            theme: "light".into(),
            volume: 1,
        };
        store.update(|tx| s.set(tx, v.clone())).unwrap();
        assert_eq!(store.view(|tx| s.get(tx)).unwrap(), v);

        store.update(|tx| s.clear(tx)).unwrap();
        assert_eq!(store.view(|tx| s.get(tx)).unwrap(), Settings::default());
    }

    #[test]
    fn test_transform_starts_from_default() {
        let store = MemoryStore::new();
        let s = Singleton::with_default(
            Namespace::new(30),
            Settings {
                theme: "dark".into(),
                volume: 5,
            },
        );
        let v = store
            .update(|tx| {
                s.transform(tx, |v| {
                    v.volume += 1;
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(v.theme, "dark");
        assert_eq!(v.volume, 6);
    }

    #[test]
    fn test_unchanged_set_skips_hooks() {
        let store = MemoryStore::new();
        let s: Singleton<Settings> = Singleton::new(Namespace::new(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        s.on_set(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let v = Settings {
            theme: "x".into(),
            volume: 0,
        };
        store.update(|tx| s.set(tx, v.clone())).unwrap();
        store.update(|tx| s.set(tx, v.clone())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_error_propagates() {
        let store = MemoryStore::new();
        let s: Singleton<Settings> = Singleton::new(Namespace::new(30));
        s.on_set(|_, _, _| Err(Error::InvalidOperation("nope".into())));
        assert!(store.update(|tx| s.set(tx, Settings::default())).is_err());
        assert_eq!(store.view(|tx| s.try_get(tx)).unwrap(), None);
    }
}
