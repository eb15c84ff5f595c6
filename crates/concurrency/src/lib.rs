//! Concurrency layer for Tessera
//!
//! This crate implements coordination between processes sharing one store:
//! - LeaseMutex: named lock held through an expiring lease record
//! - LeaseGuard: proof of ownership that keeps the lease refreshed
//! - MutexOptions: lease TTL, refresh period and retry jitter
//!
//! Nothing here relies on in-process state for exclusion. Two mutexes with
//! the same name over the same store exclude each other even when they live
//! in different processes, as long as their clocks roughly agree.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lease;
pub mod mutex;

pub use lease::{now_ms, Lease};
pub use mutex::{LeaseGuard, LeaseMutex, MutexOptions};
