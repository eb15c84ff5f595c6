//! Peer replication protocol
//!
//! Two replicas of the same data replicate over four request/response
//! calls, defined by [`ReplicationPeer`]:
//!
//! | call           | request                          | response                 |
//! |----------------|----------------------------------|--------------------------|
//! | `open`         | store version, replica id, checkpoints | same, from the peer |
//! | `bootstrap`    | full dump, delta logs, sender version | peer's checkpoint   |
//! | `sync`         | delta logs                       | peer's checkpoint        |
//! | `allocate_ids` |                                  | start of a reserved id block |
//!
//! [`PeerService`] answers the calls against a local `ReplicatedStore`.
//! [`PeerSession`] drives them from the initiating side: it opens the
//! session, bootstraps a peer that has never replicated or sends it the
//! compressed delta since its checkpoint, then pushes every log committed
//! locally until cancelled.
//!
//! Transports are not part of this crate. A transport implements
//! `ReplicationPeer` by forwarding the serde message types; `PeerService`
//! implements it in-process.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_core::{Error, Result, VersionVector};
use tessera_primitives::IdAllocator;
use tessera_storage::Store;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{Checkpoint, Event, EventLog};
use crate::store::{ReplicatedStore, STORE_VERSION};

/// Handshake request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Sender's store schema version
    pub store_version: u32,
    /// Sender's replica id
    pub replica_id: u64,
    /// Every checkpoint the sender knows
    pub checkpoints: Vec<Checkpoint>,
}

/// Handshake response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenResponse {
    /// Responder's store schema version
    pub store_version: u32,
    /// Responder's replica id
    pub replica_id: u64,
    /// Every checkpoint the responder knows
    pub checkpoints: Vec<Checkpoint>,
}

/// Full state transfer to a peer with no prior overlap
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    /// Every live replicated record
    pub events: Vec<Event>,
    /// Logs kept for relaying to further replicas
    pub logs: Vec<EventLog>,
    /// Sender's checkpoint version when the dump was taken
    pub version: VersionVector,
}

/// Bootstrap response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    /// Responder's checkpoint after applying the dump
    pub checkpoint: Checkpoint,
}

/// Incremental transfer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Logs the responder may not have seen
    pub logs: Vec<EventLog>,
}

/// Sync response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Responder's checkpoint after applying the logs
    pub checkpoint: Checkpoint,
}

/// Reserved block of record ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateIdsResponse {
    /// First id of the block
    pub start: u64,
    /// Number of ids in the block
    pub count: u64,
}

/// The replication calls one replica makes on another
pub trait ReplicationPeer: Send + Sync {
    /// Exchange store versions and checkpoints
    fn open(&self, req: OpenRequest) -> impl Future<Output = Result<OpenResponse>> + Send;

    /// Transfer a full dump
    fn bootstrap(
        &self,
        req: BootstrapRequest,
    ) -> impl Future<Output = Result<BootstrapResponse>> + Send;

    /// Transfer logs
    fn sync(&self, req: SyncRequest) -> impl Future<Output = Result<SyncResponse>> + Send;

    /// Reserve a block of ids from the peer's shared counter
    fn allocate_ids(&self) -> impl Future<Output = Result<AllocateIdsResponse>> + Send;
}

impl<P: ReplicationPeer> ReplicationPeer for Arc<P> {
    fn open(&self, req: OpenRequest) -> impl Future<Output = Result<OpenResponse>> + Send {
        (**self).open(req)
    }

    fn bootstrap(
        &self,
        req: BootstrapRequest,
    ) -> impl Future<Output = Result<BootstrapResponse>> + Send {
        (**self).bootstrap(req)
    }

    fn sync(&self, req: SyncRequest) -> impl Future<Output = Result<SyncResponse>> + Send {
        (**self).sync(req)
    }

    fn allocate_ids(&self) -> impl Future<Output = Result<AllocateIdsResponse>> + Send {
        (**self).allocate_ids()
    }
}

fn check_store_version(remote: u32) -> Result<()> {
    if remote != STORE_VERSION {
        return Err(Error::IncompatibleStoreVersion {
            local: STORE_VERSION,
            remote,
        });
    }
    Ok(())
}

/// Responder side of the protocol over a local store
pub struct PeerService<S: Store> {
    store: Arc<ReplicatedStore<S>>,
    ids: IdAllocator<Arc<ReplicatedStore<S>>>,
}

impl<S: Store> PeerService<S> {
    /// Service answering for `store`; `allocate_ids` hands out blocks of
    /// `id_block_size`
    pub fn new(store: Arc<ReplicatedStore<S>>, id_block_size: u64) -> Self {
        let ids = IdAllocator::new(Arc::clone(&store), id_block_size);
        Self { store, ids }
    }

    /// Store the service answers for
    pub fn store(&self) -> &Arc<ReplicatedStore<S>> {
        &self.store
    }
}

impl<S: Store> ReplicationPeer for PeerService<S> {
    async fn open(&self, req: OpenRequest) -> Result<OpenResponse> {
        check_store_version(req.store_version)?;
        self.store.merge_checkpoints(req.checkpoints)?;
        debug!(
            target: "tessera::replication",
            replica_id = self.store.replica_id(),
            remote_replica_id = req.replica_id,
            "peer opened"
        );
        Ok(OpenResponse {
            store_version: STORE_VERSION,
            replica_id: self.store.replica_id(),
            checkpoints: self.store.get_checkpoints()?,
        })
    }

    async fn bootstrap(&self, req: BootstrapRequest) -> Result<BootstrapResponse> {
        let mut checkpoint = self.store.apply_events(req.events, &req.version)?;
        if !req.logs.is_empty() {
            checkpoint = self.store.apply_event_logs(req.logs)?;
        }
        Ok(BootstrapResponse { checkpoint })
    }

    async fn sync(&self, req: SyncRequest) -> Result<SyncResponse> {
        let checkpoint = self.store.apply_event_logs(req.logs)?;
        Ok(SyncResponse { checkpoint })
    }

    async fn allocate_ids(&self) -> Result<AllocateIdsResponse> {
        let start = self.ids.reserve_block()?;
        Ok(AllocateIdsResponse {
            start,
            count: self.ids.block_size(),
        })
    }
}

/// Lifecycle of a `PeerSession`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet opened
    Registered,
    /// Handshake done, initial transfer in progress
    Syncing,
    /// Caught up; pushing local commits as they happen
    Idle,
    /// Stopped
    Closed,
}

/// Initiator side of the protocol for one peer
pub struct PeerSession<S: Store, P: ReplicationPeer> {
    store: Arc<ReplicatedStore<S>>,
    peer: P,
    state: SessionState,
    remote_replica_id: Option<u64>,
    commits: broadcast::Receiver<EventLog>,
}

impl<S: Store, P: ReplicationPeer> PeerSession<S, P> {
    /// Session replicating `store` to `peer`
    ///
    /// Local commits are captured from this point on, so none made while
    /// the session opens are missed.
    pub fn new(store: Arc<ReplicatedStore<S>>, peer: P) -> Self {
        let commits = store.subscribe();
        Self {
            store,
            peer,
            state: SessionState::Registered,
            remote_replica_id: None,
            commits,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Peer's replica id, once opened
    pub fn remote_replica_id(&self) -> Option<u64> {
        self.remote_replica_id
    }

    /// Handshake, then bring the peer up to date
    ///
    /// A peer whose own checkpoint knows of no other replica is
    /// bootstrapped with a full dump; any other peer is sent the compressed
    /// delta since its checkpoint.
    ///
    /// # Errors
    ///
    /// `IncompatibleStoreVersion` when the peer speaks another schema
    /// version, or any error of the peer calls. The session is closed on
    /// error.
    pub async fn open(&mut self) -> Result<()> {
        let result = self.try_open().await;
        if result.is_err() {
            self.state = SessionState::Closed;
        }
        result
    }

    async fn try_open(&mut self) -> Result<()> {
        let res = self
            .peer
            .open(OpenRequest {
                store_version: STORE_VERSION,
                replica_id: self.store.replica_id(),
                checkpoints: self.store.get_checkpoints()?,
            })
            .await?;
        check_store_version(res.store_version)?;
        self.remote_replica_id = Some(res.replica_id);
        self.state = SessionState::Syncing;

        let remote = res
            .checkpoints
            .iter()
            .find(|c| c.id == res.replica_id)
            .cloned()
            .unwrap_or_else(|| Checkpoint::new(res.replica_id, VersionVector::new()));
        self.store.merge_checkpoints(res.checkpoints)?;

        let checkpoint = if remote.version.len() <= 1 {
            info!(
                target: "tessera::replication",
                remote_replica_id = res.replica_id,
                "bootstrapping peer"
            );
            let version = self.store.checkpoint()?.version;
            self.peer
                .bootstrap(BootstrapRequest {
                    events: self.store.dump()?,
                    logs: self.store.compressed_delta(&VersionVector::new())?,
                    version,
                })
                .await?
                .checkpoint
        } else {
            self.push(self.store.compressed_delta(&remote.version)?).await?
        };
        self.store.merge_checkpoints(vec![checkpoint])?;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Send `logs` and record the peer's resulting checkpoint
    pub async fn sync(&mut self, logs: Vec<EventLog>) -> Result<Checkpoint> {
        let checkpoint = self.push(logs).await?;
        self.store.merge_checkpoints(vec![checkpoint.clone()])?;
        Ok(checkpoint)
    }

    async fn push(&self, logs: Vec<EventLog>) -> Result<Checkpoint> {
        let count = logs.len();
        let res = self.peer.sync(SyncRequest { logs }).await?;
        debug!(
            target: "tessera::replication",
            remote_replica_id = ?self.remote_replica_id,
            logs = count,
            "synced peer"
        );
        Ok(res.checkpoint)
    }

    /// Reserve a block of ids from the peer
    pub async fn allocate_ids(&self) -> Result<AllocateIdsResponse> {
        self.peer.allocate_ids().await
    }

    /// Push local commits to the peer until `ctx` is cancelled
    ///
    /// Opens the session first if needed. When commits are missed because
    /// the session fell behind, the compressed delta since the peer's
    /// checkpoint is sent instead.
    pub async fn run(&mut self, ctx: CancellationToken) -> Result<()> {
        if self.state == SessionState::Registered {
            self.open().await?;
        }
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    self.state = SessionState::Closed;
                    return Ok(());
                }
                next = self.commits.recv() => next,
            };
            match next {
                Ok(log) => {
                    self.sync(vec![log]).await?;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        target: "tessera::replication",
                        remote_replica_id = ?self.remote_replica_id,
                        missed,
                        "session lagged; resending delta"
                    );
                    let version = self.remote_version()?;
                    let delta = self.store.compressed_delta(&version)?;
                    self.sync(delta).await?;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.state = SessionState::Closed;
                    return Ok(());
                }
            }
        }
    }

    fn remote_version(&self) -> Result<VersionVector> {
        let Some(id) = self.remote_replica_id else {
            return Ok(VersionVector::new());
        };
        Ok(self
            .store
            .get_checkpoints()?
            .into_iter()
            .find(|c| c.id == id)
            .map(|c| c.version)
            .unwrap_or_default())
    }
}
