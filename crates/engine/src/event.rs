//! Replication wire values: events, event logs and checkpoints

use serde::{Deserialize, Serialize};
use tessera_core::{Namespace, Record, VersionVector};

/// One replicated mutation of a record
///
/// `record` holds the encoded projection of the record for writes and is
/// `None` for deletes. Logs persisted locally drop it as well; filters
/// reload the payload from the live table when a stored log is replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Namespace of the table or singleton the record lives in
    pub namespace: Namespace,
    /// Record id; 0 for singletons
    pub id: u64,
    /// Version of the record after the mutation
    pub version: VersionVector,
    /// Encoded record
    pub record: Option<Vec<u8>>,
    /// True when the record was deleted
    pub delete: bool,
}

impl Event {
    /// Write of `record` at `version`
    pub fn write(namespace: Namespace, id: u64, version: VersionVector, record: Vec<u8>) -> Self {
        Self {
            namespace,
            id,
            version,
            record: Some(record),
            delete: false,
        }
    }

    /// Deletion at `version`
    pub fn delete(namespace: Namespace, id: u64, version: VersionVector) -> Self {
        Self {
            namespace,
            id,
            version,
            record: None,
            delete: true,
        }
    }

    /// Identity of the record the event mutates
    pub fn key(&self) -> EventKey {
        EventKey {
            namespace: self.namespace,
            id: self.id,
        }
    }
}

/// `(namespace, id)` of a replicated record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    /// Namespace
    pub namespace: Namespace,
    /// Record id
    pub id: u64,
}

/// What one replica is known to have observed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Replica id
    pub id: u64,
    /// Version vector the replica had reached
    pub version: VersionVector,
    /// Set once the replica is retired
    pub deleted: bool,
}

impl Checkpoint {
    /// Checkpoint of `replica` at `version`
    pub fn new(replica: u64, version: VersionVector) -> Self {
        Self {
            id: replica,
            version,
            deleted: false,
        }
    }

    /// The replica's own counter in its version
    pub fn local_version(&self) -> u64 {
        self.version.get(self.id)
    }
}

impl Record for Checkpoint {
    fn id(&self) -> u64 {
        self.id
    }
}

/// Events committed together by one replica in one transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    /// Log id, unique per origin replica
    pub id: u64,
    /// Origin replica's checkpoint right after the commit
    pub checkpoint: Checkpoint,
    /// Mutations in commit order
    pub events: Vec<Event>,
}

impl EventLog {
    /// Origin replica id
    pub fn replica_id(&self) -> u64 {
        self.checkpoint.id
    }

    /// Origin replica's counter when the log was committed
    pub fn local_version(&self) -> u64 {
        self.checkpoint.local_version()
    }

    /// Copy without record payloads
    pub fn stripped(&self) -> Self {
        Self {
            id: self.id,
            checkpoint: self.checkpoint.clone(),
            events: self
                .events
                .iter()
                .map(|e| Event {
                    record: None,
                    ..e.clone()
                })
                .collect(),
        }
    }
}

/// Pointwise maximum of the checkpoint versions of `logs`
pub fn max_version(logs: &[EventLog]) -> VersionVector {
    VersionVector::from_vectors(logs.iter().map(|l| &l.checkpoint.version))
}

/// Pointwise minimum of the checkpoint versions of `logs`
///
/// Replicas missing from any log are dropped. Empty for no logs.
pub fn min_version(logs: &[EventLog]) -> VersionVector {
    let mut iter = logs.iter();
    let Some(first) = iter.next() else {
        return VersionVector::new();
    };
    let mut v = first.checkpoint.version.clone();
    for l in iter {
        v.downgrade(&l.checkpoint.version);
    }
    v
}
