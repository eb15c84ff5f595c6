//! Cache expiry background task
//!
//! CacheGc runs in a background thread and ticks every registered cache
//! once per interval. Each tick drains one timer wheel bucket per cache.
//!
//! # Design Notes
//!
//! - Caches are held as `Arc<dyn Collectable>`, so one thread serves caches
//!   of any record type
//! - Graceful shutdown via atomic flag, polled at least every 100ms

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tessera_core::Record;
use tessera_storage::Store;
use tracing::trace;

use crate::cache::CacheStore;

/// Anything with a periodic expiry tick
pub trait Collectable: Send + Sync {
    /// Run one tick, returning how many entries expired
    fn gc(&self) -> usize;
}

impl<T: Record, S: Store> Collectable for CacheStore<T, S> {
    fn gc(&self) -> usize {
        CacheStore::gc(self)
    }
}

/// Background cache expiry task
///
/// # Example
///
/// ```ignore
/// let cache = Arc::new(CacheStore::new(store, users, CacheOptions::default()));
/// let gc = CacheGc::new(cache.options().gc_interval);
/// gc.register(cache.clone());
/// let handle = gc.start();
///
/// // ... use the cache ...
///
/// gc.shutdown();
/// handle.join().unwrap();
/// ```
pub struct CacheGc {
    interval: Duration,
    targets: Arc<Mutex<Vec<Arc<dyn Collectable>>>>,
    shutdown: Arc<AtomicBool>,
}

impl CacheGc {
    /// Create a task ticking every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            targets: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a cache to tick; may be called after `start`
    pub fn register(&self, target: Arc<dyn Collectable>) {
        self.targets.lock().push(target);
    }

    /// Run one tick over every registered cache
    pub fn tick(&self) -> usize {
        tick(&self.targets)
    }

    /// Start the background thread
    ///
    /// The thread runs until `shutdown()` is called.
    pub fn start(&self) -> JoinHandle<()> {
        let targets = Arc::clone(&self.targets);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        thread::spawn(move || {
            let sleep_interval = Duration::from_millis(100).min(interval);
            while !shutdown.load(Ordering::Relaxed) {
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(sleep_interval);
                    elapsed += sleep_interval;
                }
                tick(&targets);
            }
        })
    }

    /// Signal shutdown; the thread exits on its next poll
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn tick(targets: &Mutex<Vec<Arc<dyn Collectable>>>) -> usize {
    // Snapshot so a slow cache never blocks register()
    let targets: Vec<_> = targets.lock().clone();
    let evicted = targets.iter().map(|t| t.gc()).sum();
    trace!(target: "tessera::cache", caches = targets.len(), evicted, "gc tick");
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Collectable for Counter {
        fn gc(&self) -> usize {
            self.0.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    #[test]
    fn test_tick_visits_every_target() {
        let gc = CacheGc::new(Duration::from_secs(60));
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        gc.register(a.clone());
        gc.register(b.clone());
        assert_eq!(gc.tick(), 2);
        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_background_thread_ticks() {
        let gc = CacheGc::new(Duration::from_millis(10));
        let c = Arc::new(Counter::default());
        gc.register(c.clone());
        let handle = gc.start();
        thread::sleep(Duration::from_millis(200));
        gc.shutdown();
        handle.join().unwrap();
        assert!(c.0.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_graceful_shutdown() {
        let gc = CacheGc::new(Duration::from_secs(10));
        let handle = gc.start();
        gc.shutdown();
        assert!(gc.is_shutdown());

        let start = Instant::now();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1), "Should shutdown quickly");
    }
}
