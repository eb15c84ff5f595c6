//! LeaseMutex: a named lock over the backing store
//!
//! ## Design
//!
//! The lock is a single `Lease { expiry_ms, token }` at `3:<name>`. Each
//! `LeaseMutex` instance carries a random token; holding the lock means the
//! stored lease carries that token and has not expired.
//!
//! Acquisition is one store transaction that checks for a live foreign
//! lease and writes our own. `lock` retries after a random delay in
//! `[recheck_min, recheck_max]` so waiters do not retry in step.
//!
//! Once acquired, a background task extends the lease every
//! `refresh_interval`. The task stops when the guard is unlocked or dropped,
//! or when the caller's cancellation token fires, and then deletes the
//! lease if it is still ours. If a refresh fails the lease is considered
//! lost: the guard's `lease_lost()` future completes and the task exits
//! without touching the store.
//!
//! `with_lock` runs a future under the lock and, when `ctx` is cancelled,
//! awaits the release before returning `Cancelled`.
//!
//! One instance (and its clones) holds at most one guard at a time; a
//! second acquisition through it fails with `LockBusy` until the first
//! guard's lease is released.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tessera_core::{reserved, Error, MutexConfig, Result};
use tessera_storage::Store;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::lease::{self, now_ms, Lease};

/// Lease timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexOptions {
    /// Lease lifetime
    pub ttl: Duration,
    /// Period at which a held lease is extended; must be below `ttl`
    pub refresh_interval: Duration,
    /// Shortest wait between acquisition attempts
    pub recheck_min: Duration,
    /// Longest wait between acquisition attempts
    pub recheck_max: Duration,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self::from(&MutexConfig::default())
    }
}

impl From<&MutexConfig> for MutexOptions {
    fn from(config: &MutexConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            refresh_interval: Duration::from_millis(config.refresh_interval_ms),
            recheck_min: Duration::from_millis(config.recheck_min_ms),
            recheck_max: Duration::from_millis(config.recheck_max_ms),
        }
    }
}

impl MutexOptions {
    fn recheck_delay(&self) -> Duration {
        if self.recheck_max <= self.recheck_min {
            return self.recheck_min;
        }
        rand::thread_rng().gen_range(self.recheck_min..=self.recheck_max)
    }
}

struct MutexInner<S> {
    store: S,
    name: String,
    key: String,
    token: String,
    options: MutexOptions,
    held: AtomicBool,
}

/// Distributed mutex identified by name
pub struct LeaseMutex<S: Store> {
    inner: Arc<MutexInner<S>>,
}

impl<S: Store> Clone for LeaseMutex<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store> std::fmt::Debug for LeaseMutex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseMutex")
            .field("name", &self.inner.name)
            .field("token", &self.inner.token)
            .finish()
    }
}

impl<S: Store + 'static> LeaseMutex<S> {
    /// Mutex `name` over `store` with a fresh holder token
    pub fn new(store: S, name: impl Into<String>, options: MutexOptions) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(MutexInner {
                key: reserved::MUTEX.format_name(&name),
                token: Uuid::new_v4().to_string(),
                store,
                name,
                options,
                held: AtomicBool::new(false),
            }),
        }
    }

    /// Lock name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Token written into leases taken by this instance
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Lease timing
    pub fn options(&self) -> &MutexOptions {
        &self.inner.options
    }

    /// The lease currently stored, live or not
    pub fn holder(&self) -> Result<Option<Lease>> {
        self.inner.store.view(|tx| lease::read(tx, &self.inner.key))
    }

    fn acquire(&self) -> Result<Lease> {
        let i = &self.inner;
        i.store
            .update(|tx| lease::acquire(tx, &i.name, &i.key, &i.token, i.options.ttl, now_ms()))
    }

    fn refresh(&self) -> Result<Lease> {
        let i = &self.inner;
        i.store
            .update(|tx| lease::refresh(tx, &i.name, &i.key, &i.token, i.options.ttl, now_ms()))
    }

    fn release(&self) -> Result<bool> {
        let i = &self.inner;
        let released = i.store.update(|tx| lease::release(tx, &i.key, &i.token))?;
        debug!(target: "tessera::mutex", name = %i.name, released, "lease released");
        Ok(released)
    }

    /// Single acquisition attempt
    ///
    /// The returned guard keeps the lease alive until it is unlocked or
    /// dropped, or until `ctx` is cancelled.
    ///
    /// # Errors
    ///
    /// `LockBusy` when another holder has a live lease or this instance
    /// already holds a guard; `Cancelled` when `ctx` is already cancelled.
    pub async fn try_lock(&self, ctx: &CancellationToken) -> Result<LeaseGuard<S>> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.inner.held.swap(true, Ordering::AcqRel) {
            return Err(Error::LockBusy {
                name: self.inner.name.clone(),
            });
        }
        let lease = match self.acquire() {
            Ok(lease) => lease,
            Err(e) => {
                self.inner.held.store(false, Ordering::Release);
                return Err(e);
            }
        };
        debug!(target: "tessera::mutex", name = %self.inner.name, expiry_ms = lease.expiry_ms, "lease acquired");
        Ok(LeaseGuard::start(self.clone(), ctx))
    }

    /// Wait until the lock is acquired or `ctx` is cancelled
    pub async fn lock(&self, ctx: &CancellationToken) -> Result<LeaseGuard<S>> {
        loop {
            match self.try_lock(ctx).await {
                Err(Error::LockBusy { .. }) => {}
                other => return other,
            }
            let delay = self.inner.options.recheck_delay();
            debug!(
                target: "tessera::mutex",
                name = %self.inner.name,
                delay_ms = delay.as_millis() as u64,
                "lease busy, waiting"
            );
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run `f` while holding the lock
    ///
    /// The lease is released before this returns, whichever way `f` ends.
    ///
    /// # Errors
    ///
    /// `Cancelled` when `ctx` fires, before or during `f`; `LockLost` when
    /// the lease is taken over while `f` runs. `f` is dropped in both cases.
    /// Otherwise the error of `f`, or of the release.
    pub async fn with_lock<F, T>(&self, ctx: &CancellationToken, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guard = self.lock(ctx).await?;
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            _ = guard.lease_lost() => None,
            result = f => Some(result),
        };
        let released = guard.unlock().await;
        match outcome {
            Some(Err(e)) => Err(e),
            Some(Ok(value)) => released.map(|_| value),
            None if ctx.is_cancelled() => {
                released?;
                Err(Error::Cancelled)
            }
            None => Err(released.err().unwrap_or(Error::LockLost {
                name: self.inner.name.clone(),
            })),
        }
    }
}

/// Ownership of a `LeaseMutex`
///
/// Dropping the guard, or cancelling the `ctx` it was taken with, stops the
/// refresh task, which then releases the lease in the background. Use
/// `unlock` or `LeaseMutex::with_lock` to wait for the release.
pub struct LeaseGuard<S: Store + 'static> {
    mutex: LeaseMutex<S>,
    stop: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<Result<bool>>>,
}

impl<S: Store + 'static> LeaseGuard<S> {
    fn start(mutex: LeaseMutex<S>, ctx: &CancellationToken) -> Self {
        let stop = ctx.child_token();
        let lost = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(mutex.clone(), stop.clone(), lost.clone()));
        Self {
            mutex,
            stop,
            lost,
            task: Some(task),
        }
    }

    /// Mutex this guard holds
    pub fn mutex(&self) -> &LeaseMutex<S> {
        &self.mutex
    }

    /// Completes once a refresh has failed and the lock can no longer be
    /// assumed held
    pub fn lease_lost(&self) -> WaitForCancellationFuture<'_> {
        self.lost.cancelled()
    }

    /// True once the lease has been lost
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop refreshing and release the lease
    ///
    /// Returns whether a lease was deleted. Fails with `LockLost` when the
    /// lease had already been lost.
    pub async fn unlock(mut self) -> Result<bool> {
        self.stop.cancel();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::InvalidOperation(format!("lease task failed: {e}")))?,
            None => Ok(false),
        }
    }
}

impl<S: Store + 'static> Drop for LeaseGuard<S> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn refresh_loop<S: Store + 'static>(
    mutex: LeaseMutex<S>,
    stop: CancellationToken,
    lost: CancellationToken,
) -> Result<bool> {
    let result = hold(&mutex, stop, lost).await;
    mutex.inner.held.store(false, Ordering::Release);
    result
}

async fn hold<S: Store + 'static>(
    mutex: &LeaseMutex<S>,
    stop: CancellationToken,
    lost: CancellationToken,
) -> Result<bool> {
    let mut ticker = tokio::time::interval(mutex.inner.options.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was just written
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return mutex.release(),
            _ = ticker.tick() => {
                if let Err(e) = mutex.refresh() {
                    warn!(target: "tessera::mutex", name = %mutex.inner.name, error = %e, "lease refresh failed");
                    lost.cancel();
                    return Err(match e {
                        Error::LockLost { .. } => e,
                        _ => Error::LockLost { name: mutex.inner.name.clone() },
                    });
                }
            }
        }
    }
}
