//! Lease records
//!
//! A lease is the single store value behind a named mutex. Whoever's token
//! is in an unexpired lease holds the lock. An expired lease is free for
//! anyone to overwrite.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::{decode, encode, Error, Result};
use tessera_storage::{ReadTx, WriteTx};

/// Stored lease value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unix milliseconds after which the lease is void
    pub expiry_ms: i64,
    /// Identity of the holder
    pub token: String,
}

impl Lease {
    /// True while `now_ms` is before the expiry
    pub fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expiry_ms
    }
}

/// Current wall clock in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lease stored at `key`, if any
pub fn read<R: ReadTx + ?Sized>(tx: &R, key: &str) -> Result<Option<Lease>> {
    tx.get(key)?.map(|b| decode(&b)).transpose()
}

/// Take or extend the lease at `key` for `token`
///
/// # Errors
///
/// `LockBusy` when a live lease with another token exists.
pub fn acquire(
    tx: &mut dyn WriteTx,
    name: &str,
    key: &str,
    token: &str,
    ttl: Duration,
    now_ms: i64,
) -> Result<Lease> {
    if let Some(held) = read(&*tx, key)? {
        if held.token != token && held.is_live(now_ms) {
            return Err(Error::LockBusy { name: name.into() });
        }
    }
    let lease = Lease {
        expiry_ms: now_ms.saturating_add(ttl.as_millis() as i64),
        token: token.into(),
    };
    tx.put(key, encode(&lease)?)?;
    Ok(lease)
}

/// Extend a lease `token` already holds
///
/// # Errors
///
/// `LockLost` when the stored lease is missing, expired, or owned by
/// another token.
pub fn refresh(
    tx: &mut dyn WriteTx,
    name: &str,
    key: &str,
    token: &str,
    ttl: Duration,
    now_ms: i64,
) -> Result<Lease> {
    match read(&*tx, key)? {
        Some(held) if held.token == token && held.is_live(now_ms) => {
            acquire(tx, name, key, token, ttl, now_ms)
        }
        _ => Err(Error::LockLost { name: name.into() }),
    }
}

/// Delete the lease at `key` if `token` still holds it
pub fn release(tx: &mut dyn WriteTx, key: &str, token: &str) -> Result<bool> {
    match read(&*tx, key)? {
        Some(held) if held.token == token => {
            tx.delete(key)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
