//! Error types for Tessera
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::key::Namespace;
use std::io;
use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Tessera storage engine
#[derive(Debug, Error)]
pub enum Error {
    /// Read of an absent key
    #[error("record not found: {key}")]
    RecordNotFound {
        /// Store key that was looked up
        key: String,
    },

    /// Insert of an id that already has a record
    #[error("record already exists: {key}")]
    RecordExists {
        /// Store key of the existing record
        key: String,
    },

    /// A unique index already maps the key to a different record and no
    /// conflict resolver was configured
    #[error("unique constraint violated in index {namespace}")]
    UniqueConstraintViolated {
        /// Namespace of the violated index
        namespace: Namespace,
    },

    /// Another holder owns an unexpired lease on the mutex
    #[error("lock busy: {name}")]
    LockBusy {
        /// Mutex name
        name: String,
    },

    /// The lease was taken over by another holder while it was held
    #[error("lock lost: {name}")]
    LockLost {
        /// Mutex name
        name: String,
    },

    /// An event references a namespace with no registered replicator
    #[error("replicator not found for namespace {0}")]
    ReplicatorNotFound(Namespace),

    /// Peer advertised a store schema version we cannot replicate with
    #[error("incompatible store version: local {local}, remote {remote}")]
    IncompatibleStoreVersion {
        /// Local store version
        local: u32,
        /// Version advertised by the peer
        remote: u32,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backing store failure, propagated verbatim
    #[error("storage error: {0}")]
    Storage(String),

    /// Write attempted through a read-only transaction
    #[error("cannot write through a read-only transaction")]
    ReadOnly,

    /// Invalid operation or state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),

    /// I/O error (config files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The caller's cancellation fired before the operation finished
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build a `RecordNotFound` for a store key
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::RecordNotFound { key: key.into() }
    }

    /// True for `RecordNotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RecordNotFound { .. })
    }

    /// True for errors caused by a concurrent writer claiming the same id or
    /// unique key; the operation may succeed if retried after a fresh read
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            Error::RecordExists { .. } | Error::UniqueConstraintViolated { .. }
        )
    }

    /// True for `UniqueConstraintViolated`
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::UniqueConstraintViolated { .. })
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::not_found("7:000000000000002a");
        let msg = err.to_string();
        assert!(msg.contains("record not found"));
        assert!(msg.contains("7:000000000000002a"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_display_unique() {
        let err = Error::UniqueConstraintViolated {
            namespace: Namespace::new(12),
        };
        assert!(err.to_string().contains("12"));
        assert!(err.is_unique_violation());
        assert!(err.is_write_conflict());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_error_display_lock_busy() {
        let err = Error::LockBusy {
            name: "replication".to_string(),
        };
        assert_eq!(err.to_string(), "lock busy: replication");
    }

    #[test]
    fn test_error_display_store_version() {
        let err = Error::IncompatibleStoreVersion {
            local: 1,
            remote: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("local 1"));
        assert!(msg.contains("remote 2"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_decode() {
        let result: Result<String> = rmp_serde::from_slice(&[0xc1]).map_err(Error::from);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
