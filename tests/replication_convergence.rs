//! Three-replica relay through the public facade
//!
//! r1 -> r2 -> r3, where r2 forwards logs it received from r1. Concurrent
//! edits on r1 and r3 must settle on the same record everywhere.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera::{
    MemoryStore, Namespace, PeerService, PeerSession, Record, Replicated, ReplicatedStore,
    ReplicationRegistry, ReplicatorOptions, SessionState, Store, Table, TableReplicator,
    VersionVector,
};

const DOCS: Namespace = Namespace::new(40);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Doc {
    id: u64,
    title: String,
    version: VersionVector,
}

impl Record for Doc {
    fn id(&self) -> u64 {
        self.id
    }
}

impl Replicated for Doc {
    fn version(&self) -> &VersionVector {
        &self.version
    }
    fn version_mut(&mut self) -> &mut VersionVector {
        &mut self.version
    }
}

fn doc(id: u64, title: &str) -> Doc {
    Doc {
        id,
        title: title.into(),
        ..Default::default()
    }
}

struct Node {
    store: Arc<ReplicatedStore<MemoryStore>>,
    docs: Table<Doc>,
}

impl Node {
    fn new(id: u64) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let registry = ReplicationRegistry::new();
        let docs = Table::new(DOCS);
        TableReplicator::register(&registry, &docs, ReplicatorOptions::default());
        let store = ReplicatedStore::open(MemoryStore::new(), id, registry).unwrap();
        Self {
            store: Arc::new(store),
            docs,
        }
    }

    fn write(&self, d: Doc) -> Doc {
        self.store.update(|tx| self.docs.upsert(tx, d)).unwrap()
    }

    fn title(&self, id: u64) -> Option<String> {
        self.store
            .view(|tx| self.docs.try_get(tx, id))
            .unwrap()
            .map(|d| d.title)
    }

    fn session_to(&self, other: &Node) -> PeerSession<MemoryStore, PeerService<MemoryStore>> {
        PeerSession::new(
            Arc::clone(&self.store),
            PeerService::new(Arc::clone(&other.store), 64),
        )
    }

    /// Direct delta + apply, without a session
    fn relay_to(&self, other: &Node) {
        let version = other.store.checkpoint().unwrap().version;
        let delta = self.store.compressed_delta(&version).unwrap();
        other.store.apply_event_logs(delta).unwrap();
    }
}

#[tokio::test]
async fn test_writes_reach_a_replica_two_hops_away() {
    let r1 = Node::new(1);
    let r2 = Node::new(2);
    let r3 = Node::new(3);

    r1.write(doc(1, "draft"));

    let mut s12 = r1.session_to(&r2);
    s12.open().await.unwrap();
    assert_eq!(s12.state(), SessionState::Idle);
    assert_eq!(r2.title(1).as_deref(), Some("draft"));

    let mut s23 = r2.session_to(&r3);
    s23.open().await.unwrap();
    assert_eq!(r3.title(1).as_deref(), Some("draft"));

    // r2 holds r1's logs, so it can forward later edits as well
    r1.write(doc(1, "final"));
    let delta = r1
        .store
        .compressed_delta(&r2.store.checkpoint().unwrap().version)
        .unwrap();
    s12.sync(delta).await.unwrap();
    assert_eq!(r2.title(1).as_deref(), Some("final"));

    let delta = r2
        .store
        .compressed_delta(&r3.store.checkpoint().unwrap().version)
        .unwrap();
    s23.sync(delta).await.unwrap();
    assert_eq!(r3.title(1).as_deref(), Some("final"));
    assert_eq!(r3.store.checkpoint().unwrap().version.get(1), 2);
}

#[test]
fn test_concurrent_edits_converge_across_three_replicas() {
    let r1 = Node::new(1);
    let r2 = Node::new(2);
    let r3 = Node::new(3);

    r1.write(doc(1, "base"));
    r1.relay_to(&r2);
    r2.relay_to(&r3);
    assert_eq!(r3.title(1).as_deref(), Some("base"));

    // Neither edit has seen the other
    r1.write(doc(1, "from one"));
    r3.write(doc(1, "from three"));

    r1.relay_to(&r2);
    r3.relay_to(&r2);
    r2.relay_to(&r1);
    r2.relay_to(&r3);

    let winner = r2.title(1).unwrap();
    assert!(winner == "from one" || winner == "from three");
    assert_eq!(r1.title(1).as_ref(), Some(&winner));
    assert_eq!(r3.title(1).as_ref(), Some(&winner));

    // Every replica has now seen both edits
    for node in [&r1, &r2, &r3] {
        let stored = node.store.view(|tx| node.docs.get(tx, 1)).unwrap();
        assert_eq!(stored.version.get(1), 2);
        assert_eq!(stored.version.get(3), 1);
    }
}

#[test]
fn test_deletes_relay_and_win() {
    let r1 = Node::new(1);
    let r2 = Node::new(2);
    let r3 = Node::new(3);

    r1.write(doc(7, "doomed"));
    r1.relay_to(&r2);
    r2.relay_to(&r3);

    r1.store.update(|tx| r1.docs.delete(tx, 7)).unwrap();
    r3.write(doc(7, "edited after all"));

    r1.relay_to(&r2);
    r3.relay_to(&r2);
    r2.relay_to(&r1);
    r2.relay_to(&r3);

    assert_eq!(r1.title(7), None);
    assert_eq!(r2.title(7), None);
    assert_eq!(r3.title(7), None);
}
