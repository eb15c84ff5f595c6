//! Replication engine for Tessera
//!
//! This crate turns local table mutations into replicated event logs and
//! applies logs received from peers:
//! - Event / EventLog / Checkpoint: replicated values
//! - Replicator: per-namespace apply, filter and dump, with pluggable
//!   merge and conflict policies (tables and singletons)
//! - EventFilter: compaction of event streams to the newest event per record
//! - EventLogStore / Checkpoints: persisted replication bookkeeping
//! - ReplicatedStore: store wrapper that records events and commits logs
//! - PeerService / PeerSession: the open, bootstrap and sync protocol
//!
//! Ordering between replicas comes only from version vectors. Two edits
//! of the same record that neither replica had seen when making its own
//! are concurrent, and both sides resolve them with the same policy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod event;
pub mod filter;
pub mod log_store;
pub mod peer;
pub mod replicator;
pub mod singleton_replicator;
pub mod store;
pub mod table_replicator;

pub use checkpoint::Checkpoints;
pub use event::{max_version, min_version, Checkpoint, Event, EventKey, EventLog};
pub use filter::{DeleteFilter, EventFilter, ReplicationFilter};
pub use log_store::EventLogStore;
pub use peer::{
    AllocateIdsResponse, BootstrapRequest, BootstrapResponse, OpenRequest, OpenResponse,
    PeerService, PeerSession, ReplicationPeer, SessionState, SyncRequest, SyncResponse,
};
pub use replicator::{
    default_merge, default_on_conflict, pending_events, ConflictFn, ExtractFn, MergeFn,
    PendingEvents, ReplicationRegistry, Replicator, ReplicatorOptions,
};
pub use singleton_replicator::SingletonReplicator;
pub use store::{ReplicatedStore, ReplicatedTx, StoreVersion, STORE_VERSION};
pub use table_replicator::TableReplicator;
