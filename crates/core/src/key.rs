//! Namespace and store key codec
//!
//! Every entity kind is assigned a small dense integer namespace at build
//! time. Store keys are a deterministic function of the namespace and one or
//! more key components:
//!
//! - Table record: `<ns>:<id as 16 hex digits>`
//! - Singleton: `<ns>`
//! - Composite: `<ns>:<a as 16 hex digits>:<b as 16 hex digits>`
//! - Named: `<ns>:<name>`
//!
//! Ids are rendered as fixed-width lowercase hex so that prefix scans return
//! records in id order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between key components
pub const KEY_SEPARATOR: char = ':';

/// Namespaces reserved by the engine's own tables
///
/// Application namespaces must not reuse these values.
pub mod reserved {
    use super::Namespace;

    /// Persisted store schema version singleton
    pub const STORE_VERSION: Namespace = Namespace::new(1);
    /// Id allocator counter singleton
    pub const ID_ALLOCATOR: Namespace = Namespace::new(2);
    /// Lease records of distributed mutexes
    pub const MUTEX: Namespace = Namespace::new(3);
    /// Replication event logs
    pub const REPLICATION_LOG: Namespace = Namespace::new(4);
    /// Replication checkpoints
    pub const REPLICATION_CHECKPOINT: Namespace = Namespace::new(5);

    /// First namespace available to applications
    pub const FIRST_APPLICATION: u32 = 16;
}

/// Numeric namespace of one entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(u32);

impl Namespace {
    /// Create a namespace from its numeric value
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Numeric value
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Key of a singleton stored in this namespace
    pub fn singleton_key(&self) -> String {
        self.0.to_string()
    }

    /// Key of record `id`
    pub fn format(&self, id: u64) -> String {
        format!("{}{}{:016x}", self.0, KEY_SEPARATOR, id)
    }

    /// Prefix shared by every record key of this namespace
    pub fn format_prefix(&self) -> String {
        format!("{}{}", self.0, KEY_SEPARATOR)
    }

    /// Key addressed by two numeric components
    pub fn format_composite(&self, a: u64, b: u64) -> String {
        format!(
            "{}{sep}{:016x}{sep}{:016x}",
            self.0,
            a,
            b,
            sep = KEY_SEPARATOR
        )
    }

    /// Prefix of every composite key whose first component is `a`
    pub fn format_composite_prefix(&self, a: u64) -> String {
        format!("{}{sep}{:016x}{sep}", self.0, a, sep = KEY_SEPARATOR)
    }

    /// Key addressed by a free-form name
    pub fn format_name(&self, name: &str) -> String {
        format!("{}{}{}", self.0, KEY_SEPARATOR, name)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Namespace {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
