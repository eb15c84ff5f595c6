//! Record codec
//!
//! All persisted values (records, index entries, leases, event logs) are
//! encoded as MessagePack with named fields so that adding optional fields
//! does not invalidate stored data.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value for storage
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}
