use async_trait::async_trait;
use idplane_consensus::{
    BoxError, ConsensusError, RaftConfig, RaftNode, SnapshotSink, StateMachine,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct Recorder {
    applied: Mutex<Vec<Vec<u8>>>,
}

impl Recorder {
    fn commands(&self) -> Vec<Vec<u8>> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl StateMachine for Recorder {
    async fn apply(&self, _index: u64, command: &[u8]) -> Result<(), BoxError> {
        if command == b"reject" {
            return Err("rejected by state machine".into());
        }
        self.applied.lock().push(command.to_vec());
        Ok(())
    }

    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), BoxError> {
        let encoded = serde_json::to_vec(&*self.applied.lock())?;
        if let Err(err) = sink.write_all(&encoded) {
            sink.cancel();
            return Err(err.into());
        }
        Ok(())
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), BoxError> {
        *self.applied.lock() = serde_json::from_slice(snapshot)?;
        Ok(())
    }
}

fn fast_config(id: &str, addr: &str, dir: &Path) -> RaftConfig {
    RaftConfig {
        node_id: id.into(),
        raft_addr: addr.into(),
        data_dir: dir.join(id).join("raft"),
        election_timeout_ms: 150,
        heartbeat_interval_ms: 30,
        tick_interval_ms: 10,
        apply_timeout: Duration::from_secs(5),
        ..RaftConfig::default()
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_applies_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (listener, addr) = bind().await;
    let config = fast_config("solo", &addr, dir.path());

    let node = RaftNode::start_with_listener(config.clone(), recorder.clone(), listener)
        .await
        .unwrap();
    node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    assert!(node.is_leader());

    let index = node.apply(b"first".to_vec()).await.unwrap();
    assert_eq!(recorder.commands(), vec![b"first".to_vec()]);
    let err = node.apply(b"reject".to_vec()).await.unwrap_err();
    assert!(matches!(err, ConsensusError::Apply(_)));
    let term = node.stats().term;
    node.shutdown().await;
    assert!(matches!(
        node.apply(b"late".to_vec()).await,
        Err(ConsensusError::Shutdown)
    ));

    let replayed = Arc::new(Recorder::default());
    let (listener, addr) = bind().await;
    let config = RaftConfig {
        raft_addr: addr,
        ..config
    };
    let node = RaftNode::start_with_listener(config, replayed.clone(), listener)
        .await
        .unwrap();
    node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let next = node.apply(b"second".to_vec()).await.unwrap();
    assert!(next > index);
    assert!(node.stats().term > term);
    let commands = replayed.commands();
    assert_eq!(commands.first(), Some(&b"first".to_vec()));
    assert_eq!(commands.last(), Some(&b"second".to_vec()));
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_elect_and_replicate() {
    let dir = tempfile::tempdir().unwrap();
    let mut listeners = BTreeMap::new();
    let mut addrs = BTreeMap::new();
    for id in ["n1", "n2", "n3"] {
        let (listener, addr) = bind().await;
        listeners.insert(id.to_string(), listener);
        addrs.insert(id.to_string(), addr);
    }

    let mut nodes = BTreeMap::new();
    let mut recorders = BTreeMap::new();
    for (id, listener) in listeners {
        let mut config = fast_config(&id, &addrs[&id], dir.path());
        config.peers = addrs
            .iter()
            .filter(|(peer, _)| **peer != id)
            .map(|(peer, addr)| (peer.clone(), addr.clone()))
            .collect();
        let recorder = Arc::new(Recorder::default());
        let node = RaftNode::start_with_listener(config, recorder.clone(), listener)
            .await
            .unwrap();
        recorders.insert(id.clone(), recorder);
        nodes.insert(id, node);
    }

    let leader_id = nodes["n2"]
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();
    eventually(|| nodes[&leader_id].is_leader()).await;
    let leader = &nodes[&leader_id];
    leader.apply(b"tenant.create".to_vec()).await.unwrap();

    for recorder in recorders.values() {
        let recorder = recorder.clone();
        eventually(move || recorder.commands() == vec![b"tenant.create".to_vec()]).await;
    }

    let follower = nodes.keys().find(|id| **id != leader_id).unwrap();
    eventually(|| nodes[follower].leader_id().is_some()).await;
    let err = nodes[follower].apply(b"nope".to_vec()).await.unwrap_err();
    assert!(err.is_not_leader(), "unexpected error: {err:?}");
    assert_eq!(leader.stats().peer_count, 2);

    for node in nodes.values() {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_is_compacted_after_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (listener, addr) = bind().await;
    let config = RaftConfig {
        snapshot_threshold: 3,
        ..fast_config("solo", &addr, dir.path())
    };
    let snapshots = config.data_dir.join("snapshots");
    let node = RaftNode::start_with_listener(config, recorder.clone(), listener)
        .await
        .unwrap();
    node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    for i in 0..6u8 {
        node.apply(vec![b'a' + i]).await.unwrap();
    }
    eventually(|| {
        std::fs::read_dir(&snapshots)
            .map(|entries| entries.count() == 1)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(recorder.commands().len(), 6);
    node.shutdown().await;
}
