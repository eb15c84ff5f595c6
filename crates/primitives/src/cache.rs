//! CacheStore: TTL cache in front of one table
//!
//! ## Design
//!
//! Cached items live in a generation-checked slot arena. A `SlotKey` names
//! one slot at one generation, so a key held by a stale index or bucket
//! entry stops resolving once its item is evicted and the slot reused.
//!
//! Expiry uses a timer wheel of `ceil(ttl / gc_interval)` buckets. Each
//! touch records the current logical time on the item and, if the time
//! changed, appends `(slot, time)` to the bucket for that time. Older
//! entries for the same item are left behind and ignored when their bucket
//! is drained. `gc` advances the time by one tick and drains exactly one
//! bucket, so its cost is proportional to the entries in that bucket, never
//! to the size of the cache.
//!
//! Lookups that find nothing are remembered as well, on the same wheel, so
//! repeated misses of one id or key stay off the backing store for up to
//! one ttl. Any write of a record through the cache forgets the misses it
//! resolves; a record written to the table behind the cache's back stays
//! invisible until its miss expires.
//!
//! ## Locking
//!
//! - one store-wide mutex for the arena, wheel and indices, never held
//!   while the backing store is accessed
//! - one mutex per item, held by `transform` for its read-modify-write
//!
//! The cache has no authority over correctness: every miss is satisfied by
//! the table, and writes go through the table before the cache is updated.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tessera_core::{CacheConfig, Error, Record, Result};
use tessera_storage::{ReadTx, Store};
use tracing::debug;

use crate::table::Table;

/// Cache tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Idle time after which an untouched item is evicted
    pub ttl: Duration,
    /// Period of the GC tick
    pub gc_interval: Duration,
    /// Hard limit on cached items; the least recently touched item is
    /// evicted when exceeded
    pub capacity: Option<usize>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            gc_interval: config.gc_interval(),
            capacity: config.capacity,
        }
    }
}

impl CacheOptions {
    /// Number of timer wheel buckets
    pub fn bucket_count(&self) -> usize {
        let interval = self.gc_interval.as_millis().max(1);
        let ttl = self.ttl.as_millis();
        ((ttl + interval - 1) / interval).max(1) as usize
    }
}

/// Counters of cache activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache, remembered misses included
    pub hits: u64,
    /// Lookups that went to the table
    pub misses: u64,
    /// Items added to the cache
    pub inserts: u64,
    /// Lookups or writes that failed; not-found loads are misses only
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    errors: AtomicU64,
}

/// Arena handle of one cached item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

struct CacheItem<T> {
    value: RwLock<Arc<T>>,
    lock: Mutex<()>,
    time: AtomicU64,
}

struct Slot<T> {
    generation: u32,
    item: Option<Arc<CacheItem<T>>>,
}

/// Result of a cache-only lookup
enum Cached {
    Item(SlotKey),
    Missing,
}

/// Wheel entry of a remembered miss
#[derive(Debug, Clone, Copy)]
enum MissKey {
    Primary(u64),
    /// Index position and the miss token handed out by that index
    Secondary(usize, u64),
}

/// Type-erased secondary lookup map over cached items
trait ItemIndex<T>: Send {
    fn insert(&mut self, value: &T, slot: SlotKey);
    fn remove(&mut self, value: &T, slot: SlotKey);
    fn forget_missing_of(&mut self, value: &T);
    fn expire_missing(&mut self, token: u64);
    fn clear_missing(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct KeyedIndex<T, K> {
    key: Arc<dyn Fn(&T) -> K + Send + Sync>,
    map: HashMap<K, SlotKey>,
    missing: HashMap<K, u64>,
    tokens: FxHashMap<u64, K>,
    next_token: u64,
}

impl<T, K> KeyedIndex<T, K>
where
    K: Hash + Eq + Clone,
{
    fn new(key: Arc<dyn Fn(&T) -> K + Send + Sync>) -> Self {
        Self {
            key,
            map: HashMap::new(),
            missing: HashMap::new(),
            tokens: FxHashMap::default(),
            next_token: 0,
        }
    }

    fn lookup(&self, k: &K) -> Option<Cached> {
        match self.map.get(k) {
            Some(slot) => Some(Cached::Item(*slot)),
            None if self.missing.contains_key(k) => Some(Cached::Missing),
            None => None,
        }
    }

    /// Token of the new miss, `None` when `k` is already known
    fn remember_missing(&mut self, k: &K) -> Option<u64> {
        if self.map.contains_key(k) || self.missing.contains_key(k) {
            return None;
        }
        let token = self.next_token;
        self.next_token += 1;
        self.tokens.insert(token, k.clone());
        self.missing.insert(k.clone(), token);
        Some(token)
    }

    fn forget_missing(&mut self, k: &K) {
        if let Some(token) = self.missing.remove(k) {
            self.tokens.remove(&token);
        }
    }
}

impl<T: 'static, K> ItemIndex<T> for KeyedIndex<T, K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn insert(&mut self, value: &T, slot: SlotKey) {
        let k = (self.key)(value);
        self.forget_missing(&k);
        self.map.insert(k, slot);
    }

    fn remove(&mut self, value: &T, slot: SlotKey) {
        let k = (self.key)(value);
        if self.map.get(&k) == Some(&slot) {
            self.map.remove(&k);
        }
    }

    fn forget_missing_of(&mut self, value: &T) {
        let k = (self.key)(value);
        self.forget_missing(&k);
    }

    fn expire_missing(&mut self, token: u64) {
        if let Some(k) = self.tokens.remove(&token) {
            self.missing.remove(&k);
        }
    }

    fn clear_missing(&mut self) {
        self.missing.clear();
        self.tokens.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct State<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    time: u64,
    buckets: Vec<Vec<(SlotKey, u64)>>,
    primary: FxHashMap<u64, SlotKey>,
    secondary: Vec<Box<dyn ItemIndex<T>>>,
    /// Ids known to be absent, with the time the miss was recorded
    missing: FxHashMap<u64, u64>,
    missing_buckets: Vec<Vec<(MissKey, u64)>>,
}

impl<T: Record> State<T> {
    fn new(bucket_count: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            time: 0,
            buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
            primary: FxHashMap::default(),
            secondary: Vec::new(),
            missing: FxHashMap::default(),
            missing_buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
        }
    }

    fn lookup_id(&self, id: u64) -> Option<Cached> {
        match self.primary.get(&id) {
            Some(key) => Some(Cached::Item(*key)),
            None if self.missing.contains_key(&id) => Some(Cached::Missing),
            None => None,
        }
    }

    fn remember_missing(&mut self, id: u64) {
        if self.primary.contains_key(&id) || self.missing.contains_key(&id) {
            return;
        }
        let now = self.time;
        self.missing.insert(id, now);
        let b = self.bucket_of(now);
        self.missing_buckets[b].push((MissKey::Primary(id), now));
    }

    fn remember_missing_key<K>(&mut self, position: usize, key: &K)
    where
        T: 'static,
        K: Hash + Eq + Clone + Send + Sync + 'static,
    {
        let token = self
            .secondary
            .get_mut(position)
            .and_then(|index| index.as_any_mut().downcast_mut::<KeyedIndex<T, K>>())
            .and_then(|index| index.remember_missing(key));
        if let Some(token) = token {
            let now = self.time;
            let b = self.bucket_of(now);
            self.missing_buckets[b].push((MissKey::Secondary(position, token), now));
        }
    }

    fn forget_missing_key<K>(&mut self, position: usize, key: &K)
    where
        T: 'static,
        K: Hash + Eq + Clone + Send + Sync + 'static,
    {
        if let Some(index) = self
            .secondary
            .get_mut(position)
            .and_then(|index| index.as_any_mut().downcast_mut::<KeyedIndex<T, K>>())
        {
            index.forget_missing(key);
        }
    }

    fn bucket_of(&self, time: u64) -> usize {
        (time % self.buckets.len() as u64) as usize
    }

    fn item(&self, key: SlotKey) -> Option<&Arc<CacheItem<T>>> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.item.as_ref())
    }

    fn touch(&mut self, key: SlotKey) {
        let now = self.time;
        let moved = match self.item(key) {
            Some(item) => item.time.swap(now, Ordering::Relaxed) != now,
            None => return,
        };
        if moved {
            let b = self.bucket_of(now);
            self.buckets[b].push((key, now));
        }
    }

    fn alloc(&mut self, value: Arc<T>) -> SlotKey {
        let item = Arc::new(CacheItem {
            value: RwLock::new(Arc::clone(&value)),
            lock: Mutex::new(()),
            time: AtomicU64::new(u64::MAX),
        });
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.item = Some(item);
                SlotKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    item: Some(item),
                });
                SlotKey {
                    index,
                    generation: 0,
                }
            }
        };
        self.len += 1;
        self.primary.insert(value.id(), key);
        for index in &mut self.secondary {
            index.insert(&value, key);
        }
        self.touch(key);
        key
    }

    fn remove(&mut self, key: SlotKey) -> bool {
        let Some(slot) = self.slots.get_mut(key.index as usize) else {
            return false;
        };
        if slot.generation != key.generation {
            return false;
        }
        let Some(item) = slot.item.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;

        let value = Arc::clone(&item.value.read());
        if self.primary.get(&value.id()) == Some(&key) {
            self.primary.remove(&value.id());
        }
        for index in &mut self.secondary {
            index.remove(&value, key);
        }
        true
    }

    fn replace(&mut self, key: SlotKey, value: Arc<T>) {
        let Some(item) = self.item(key).cloned() else {
            return;
        };
        let old = std::mem::replace(&mut *item.value.write(), Arc::clone(&value));
        for index in &mut self.secondary {
            index.remove(&old, key);
            index.insert(&value, key);
        }
        self.touch(key);
    }

    /// Insert or refresh the item for `value`
    fn put(&mut self, value: Arc<T>) -> bool {
        self.missing.remove(&value.id());
        for index in &mut self.secondary {
            index.forget_missing_of(&value);
        }
        match self.primary.get(&value.id()).copied() {
            Some(key) => {
                self.replace(key, value);
                false
            }
            None => {
                self.alloc(value);
                true
            }
        }
    }

    fn is_live(&self, key: SlotKey, time: u64) -> bool {
        self.item(key)
            .map_or(false, |item| item.time.load(Ordering::Relaxed) == time)
    }

    /// Advance one tick and evict everything untouched for a full wheel turn
    fn advance(&mut self) -> usize {
        self.time += 1;
        let b = self.bucket_of(self.time);
        let entries = std::mem::take(&mut self.buckets[b]);
        let mut evicted = 0;
        for (key, time) in entries {
            if self.is_live(key, time) && self.remove(key) {
                evicted += 1;
            }
        }
        for (miss, time) in std::mem::take(&mut self.missing_buckets[b]) {
            match miss {
                MissKey::Primary(id) => {
                    if self.missing.get(&id) == Some(&time) {
                        self.missing.remove(&id);
                    }
                }
                MissKey::Secondary(position, token) => {
                    if let Some(index) = self.secondary.get_mut(position) {
                        index.expire_missing(token);
                    }
                }
            }
        }
        evicted
    }

    fn evict_oldest(&mut self) -> bool {
        let n = self.buckets.len() as u64;
        for offset in 1..=n {
            let b = self.bucket_of(self.time + offset);
            let oldest = self.buckets[b]
                .iter()
                .copied()
                .find(|(key, time)| self.is_live(*key, *time));
            if let Some((key, _)) = oldest {
                return self.remove(key);
            }
        }
        false
    }
}

struct CacheInner<T: Record, S> {
    store: S,
    table: Table<T>,
    options: CacheOptions,
    state: Mutex<State<T>>,
    counters: Counters,
}

/// Read-through, write-through cache of one table
pub struct CacheStore<T: Record, S: Store> {
    inner: Arc<CacheInner<T, S>>,
}

impl<T: Record, S: Store> Clone for CacheStore<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Record, S: Store> CacheStore<T, S> {
    /// Cache `table` records read from and written to `store`
    pub fn new(store: S, table: Table<T>, options: CacheOptions) -> Self {
        let bucket_count = options.bucket_count();
        Self {
            inner: Arc::new(CacheInner {
                store,
                table,
                options,
                state: Mutex::new(State::new(bucket_count)),
                counters: Counters::default(),
            }),
        }
    }

    /// Cached table
    pub fn table(&self) -> &Table<T> {
        &self.inner.table
    }

    /// Backing store
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Cache tuning
    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Number of cached items
    pub fn len(&self) -> usize {
        self.inner.state.lock().len
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the activity counters
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    fn record_error<V>(&self, result: Result<V>) -> Result<V> {
        if result.is_err() {
            self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// `Some(None)` for a remembered miss, `None` when the store must be asked
    fn cached(
        &self,
        lookup: impl FnOnce(&State<T>) -> Option<Cached>,
    ) -> Option<Option<Arc<CacheItem<T>>>> {
        let mut state = self.inner.state.lock();
        let found = match lookup(&state)? {
            Cached::Item(key) => {
                let item = state.item(key).cloned()?;
                state.touch(key);
                Some(item)
            }
            Cached::Missing => None,
        };
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(found)
    }

    fn admit(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let mut state = self.inner.state.lock();
        if state.put(Arc::clone(&value)) {
            self.inner.counters.inserts.fetch_add(1, Ordering::Relaxed);
            if let Some(capacity) = self.inner.options.capacity {
                while state.len > capacity && state.evict_oldest() {}
            }
        }
        value
    }

    /// Read through to the store; `remember` records a not-found result
    fn load_with(
        &self,
        load: impl FnOnce(&dyn ReadTx) -> Result<T>,
        remember: impl FnOnce(&mut State<T>),
    ) -> Result<Arc<T>> {
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        match self.inner.store.view(load) {
            Ok(value) => {
                debug!(target: "tessera::cache", ns = %self.inner.table.namespace(), id = value.id(), "cache miss");
                Ok(self.admit(value))
            }
            Err(e) if e.is_not_found() => {
                let mut state = self.inner.state.lock();
                remember(&mut state);
                Err(e)
            }
            Err(e) => self.record_error(Err(e)),
        }
    }

    fn item_for(&self, id: u64) -> Result<Arc<CacheItem<T>>> {
        self.get(id)?;
        let state = self.inner.state.lock();
        state
            .primary
            .get(&id)
            .and_then(|key| state.item(*key).cloned())
            .ok_or_else(|| Error::not_found(self.inner.table.key(id)))
    }

    /// Record `id`, loading it from the table on a miss
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the table has no such record, or when a miss
    /// of `id` was recorded less than one ttl ago.
    pub fn get(&self, id: u64) -> Result<Arc<T>> {
        match self.cached(|s| s.lookup_id(id)) {
            Some(Some(item)) => return Ok(Arc::clone(&item.value.read())),
            Some(None) => return Err(Error::not_found(self.inner.table.key(id))),
            None => {}
        }
        self.load_with(
            |tx| self.inner.table.get(tx, id),
            |state| state.remember_missing(id),
        )
    }

    /// Insert through the table, then cache the stored value
    pub fn insert(&self, value: T) -> Result<Arc<T>> {
        let stored = self.record_error(
            self.inner
                .store
                .update(|tx| self.inner.table.insert(tx, value)),
        )?;
        Ok(self.admit(stored))
    }

    /// Upsert through the table, then cache the stored value
    pub fn store_value(&self, value: T) -> Result<Arc<T>> {
        let stored = self.record_error(
            self.inner
                .store
                .update(|tx| self.inner.table.upsert(tx, value)),
        )?;
        Ok(self.admit(stored))
    }

    /// Delete through the table, then drop the cached item
    pub fn delete(&self, id: u64) -> Result<()> {
        self.record_error(self.inner.store.update(|tx| self.inner.table.delete(tx, id)))?;
        self.evict(id);
        Ok(())
    }

    /// Drop the cached item or remembered miss for `id` without touching
    /// the table; true when an item was dropped
    pub fn evict(&self, id: u64) -> bool {
        let mut state = self.inner.state.lock();
        state.missing.remove(&id);
        match state.primary.get(&id).copied() {
            Some(key) => state.remove(key),
            None => false,
        }
    }

    /// Read-modify-write of record `id`
    ///
    /// Concurrent transforms of the same record are serialized by the item
    /// lock; the write itself goes through `Table::transform`.
    pub fn transform<F>(&self, id: u64, f: F) -> Result<Arc<T>>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let item = self.item_for(id)?;
        let _guard = item.lock.lock();
        let next = self.record_error(
            self.inner
                .store
                .update(|tx| self.inner.table.transform(tx, id, f)),
        )?;
        Ok(self.admit(next))
    }

    /// Record `id`, or the value built by `ctor` and inserted when absent
    ///
    /// A concurrent insert of the same id makes the insert fail with
    /// `RecordExists`; the loop then returns the winner. Any other insert
    /// error, including a unique index violation, is returned as is.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when `ctor` builds a record with another id.
    pub fn get_or_insert<F>(&self, id: u64, mut ctor: F) -> Result<Arc<T>>
    where
        F: FnMut() -> Result<T>,
    {
        loop {
            match self.get(id) {
                Err(e) if e.is_not_found() => {}
                other => return other,
            }
            let value = ctor()?;
            if value.id() != id {
                return self.record_error(Err(Error::InvalidOperation(format!(
                    "get_or_insert({id}) built record {}",
                    value.id()
                ))));
            }
            match self.insert(value) {
                Err(Error::RecordExists { .. }) => {
                    self.evict(id);
                }
                other => return other,
            }
        }
    }

    /// Register a lookup by `key(record)`, loading misses with `loader`
    ///
    /// Items already cached are indexed immediately.
    pub fn register_index<K>(
        &self,
        key: impl Fn(&T) -> K + Send + Sync + 'static,
        loader: impl Fn(&dyn ReadTx, &K) -> Result<T> + Send + Sync + 'static,
    ) -> CacheAccessor<T, S, K>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
    {
        let mut index: KeyedIndex<T, K> = KeyedIndex::new(Arc::new(key));
        let mut state = self.inner.state.lock();
        for (i, slot) in state.slots.iter().enumerate() {
            if let Some(item) = &slot.item {
                let key = SlotKey {
                    index: i as u32,
                    generation: slot.generation,
                };
                index.insert(&item.value.read(), key);
            }
        }
        state.secondary.push(Box::new(index));
        CacheAccessor {
            cache: self.clone(),
            position: state.secondary.len() - 1,
            loader: Arc::new(loader),
        }
    }

    /// Advance the wheel one tick, returning how many items expired
    pub fn gc(&self) -> usize {
        let evicted = self.inner.state.lock().advance();
        if evicted > 0 {
            debug!(target: "tessera::cache", ns = %self.inner.table.namespace(), evicted, "cache gc");
        }
        evicted
    }

    /// Drop every cached item and remembered miss
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let keys: Vec<SlotKey> = state.primary.values().copied().collect();
        for key in keys {
            state.remove(key);
        }
        state.missing.clear();
        for index in &mut state.secondary {
            index.clear_missing();
        }
    }
}

/// Insert attempts of `CacheAccessor::get_or_insert` that may end in a
/// unique index violation before the violation is returned
const UNIQUE_RETRIES: usize = 3;

/// Lookup of cached records through a registered secondary key
pub struct CacheAccessor<T: Record, S: Store, K> {
    cache: CacheStore<T, S>,
    position: usize,
    loader: Arc<dyn Fn(&dyn ReadTx, &K) -> Result<T> + Send + Sync>,
}

impl<T: Record, S: Store, K> Clone for CacheAccessor<T, S, K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            position: self.position,
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<T, S, K> CacheAccessor<T, S, K>
where
    T: Record,
    S: Store,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn lookup(&self, state: &State<T>, key: &K) -> Option<Cached> {
        state
            .secondary
            .get(self.position)?
            .as_any()
            .downcast_ref::<KeyedIndex<T, K>>()?
            .lookup(key)
    }

    /// Record indexed under `key`, loading it on a miss
    ///
    /// A loader `RecordNotFound` is remembered for up to one ttl.
    pub fn get(&self, key: &K) -> Result<Arc<T>> {
        match self.cache.cached(|s| self.lookup(s, key)) {
            Some(Some(item)) => return Ok(Arc::clone(&item.value.read())),
            Some(None) => {
                return Err(Error::not_found(
                    self.cache.inner.table.namespace().format_prefix(),
                ))
            }
            None => {}
        }
        self.cache.load_with(
            |tx| (self.loader)(tx, key),
            |state| state.remember_missing_key(self.position, key),
        )
    }

    /// Record indexed under `key`, or the value built by `ctor` and inserted
    ///
    /// Losing an insert race to another writer of the same key (a unique
    /// index violation) retries the lookup and returns the winner. The
    /// retry is bounded, so a violation of some other unique key is
    /// returned once the lookup keeps missing.
    pub fn get_or_insert<F>(&self, key: &K, mut ctor: F) -> Result<Arc<T>>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempts = 0;
        loop {
            match self.get(key) {
                Err(e) if e.is_not_found() => {}
                other => return other,
            }
            attempts += 1;
            match self.cache.insert(ctor()?) {
                Err(e) if e.is_unique_violation() && attempts < UNIQUE_RETRIES => {
                    self.cache
                        .inner
                        .state
                        .lock()
                        .forget_missing_key(self.position, key);
                }
                other => return other,
            }
        }
    }

    /// Read-modify-write of the record indexed under `key`
    pub fn transform<F>(&self, key: &K, f: F) -> Result<Arc<T>>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let id = self.get(key)?.id();
        self.cache.transform(id, f)
    }
}
