//! Core types and traits for Tessera
//!
//! This crate defines the foundational types used throughout the system:
//! - Namespace: small dense integer identifying one entity kind in the store
//! - Key codec: deterministic `<namespace>:<id-or-composite>` store keys
//! - Stored / Record / Replicated: traits every persisted value implements
//! - VersionVector: per-replica logical clock used by replication
//! - Error: Error type hierarchy
//! - TesseraConfig: `tessera.toml` configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod error;
pub mod key;
pub mod traits;
pub mod version_vector;

pub use codec::{decode, encode};
pub use config::{
    CacheConfig, MutexConfig, ReplicationConfig, TesseraConfig, CONFIG_FILE_NAME,
};
pub use error::{Error, Result};
pub use key::{reserved, Namespace, KEY_SEPARATOR};
pub use traits::{Record, Replicated, Stored};
pub use version_vector::VersionVector;
