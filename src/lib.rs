//! Tessera - replicated per-identity storage engine
//!
//! Tessera layers typed data access and multi-replica synchronization on
//! top of any transactional blob store:
//!
//! - **Tables and singletons** with set/delete hooks that run in the
//!   caller's transaction
//! - **Secondary, unique and many-to-one indexes** maintained by those hooks
//! - **TTL cache** in front of a table, swept by a background GC thread
//! - **Lease mutex** for coordinating processes that share one store
//! - **Version-vector replication** of tables and singletons between
//!   replicas, with pluggable merge and conflict policies
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{MemoryStore, ReplicatedStore, ReplicationRegistry, ReplicatorOptions, Store, Table, TableReplicator};
//!
//! let registry = ReplicationRegistry::new();
//! let notes: Table<Note> = Table::new(Namespace::new(20));
//! TableReplicator::register(&registry, &notes, ReplicatorOptions::default());
//!
//! let store = ReplicatedStore::open(MemoryStore::new(), replica_id, registry)?;
//! store.update(|tx| notes.insert(tx, note))?;
//! ```
//!
//! # Crates
//!
//! Each layer lives in its own crate and is re-exported here:
//! `tessera-core`, `tessera-storage`, `tessera-primitives`,
//! `tessera-concurrency` and `tessera-engine`.

pub use tessera_concurrency::{now_ms, Lease, LeaseGuard, LeaseMutex, MutexOptions};
pub use tessera_core::{
    decode, encode, reserved, CacheConfig, Error, MutexConfig, Namespace, Record, Replicated,
    ReplicationConfig, Result, Stored, TesseraConfig, VersionVector, CONFIG_FILE_NAME,
};
pub use tessera_engine::{
    Checkpoint, Checkpoints, Event, EventFilter, EventLog, EventLogStore, PeerService,
    PeerSession, ReplicatedStore, ReplicationPeer, ReplicationRegistry, Replicator,
    ReplicatorOptions, SessionState, SingletonReplicator, TableReplicator, STORE_VERSION,
};
pub use tessera_primitives::{
    CacheAccessor, CacheGc, CacheOptions, CacheStats, CacheStore, IdAllocator, IdGenerator,
    ManyToOne, ManyToOneOptions, SecondaryIndex, SecondaryIndexOptions, Singleton, Table,
    UniqueIndex, UniqueIndexOptions,
};
pub use tessera_storage::{MemoryStore, ReadTx, Store, WriteTx};

/// Peer protocol messages
pub mod peer {
    pub use tessera_engine::peer::*;
}
