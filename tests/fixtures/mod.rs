//! In-process cluster harness for integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use raftling::testing::{MemStateMachine, Router, RouterTransport};
use raftling::{Config, NodeId, Raft, Status};
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raftling=info".into()),
        )
        .with_test_writer()
        .try_init();
}

pub struct Node {
    pub raft: Raft,
    pub sm: Arc<MemStateMachine>,
    _dir: TempDir,
}

pub struct Harness {
    pub router: Arc<Router>,
    pub nodes: BTreeMap<NodeId, Node>,
}

/// Fast-paced test configuration: 10ms ticks, elections within ~100ms.
pub fn test_config(id: NodeId, cluster: &str, dir: &TempDir) -> Config {
    Config {
        id,
        cluster: cluster.to_string(),
        data_dir: dir.path().display().to_string(),
        tick_interval_ms: 10,
        election_tick_min: 5,
        election_tick_max: 10,
        heartbeat_tick: 2,
        lease_tick: 5,
        ..Config::default()
    }
}

pub fn cluster_string(n: usize) -> String {
    (1..=n as u64)
        .map(|i| format!("{i}@127.0.0.1:{}", 26000 + i))
        .collect::<Vec<_>>()
        .join(",")
}

/// Spawn an `n`-node in-process cluster wired through a [`Router`].
pub async fn harness(n: usize, tweak: impl Fn(&mut Config)) -> anyhow::Result<Harness> {
    init_tracing();

    let router = Router::new();
    let cluster = cluster_string(n);
    let mut nodes = BTreeMap::new();

    for id in 1..=n as u64 {
        let dir = tempfile::tempdir()?;
        let mut config = test_config(id, &cluster, &dir);
        tweak(&mut config);

        let sm = MemStateMachine::new();
        let transport = RouterTransport::new(id, router.clone());
        let raft = Raft::spawn(config, sm.clone(), transport).await?;
        router.register(id, raft.clone());

        nodes.insert(id, Node { raft, sm, _dir: dir });
    }

    Ok(Harness { router, nodes })
}

impl Harness {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    /// Wait until exactly one node reports leadership and return its id.
    pub async fn wait_leader(&self, timeout: Duration) -> anyhow::Result<NodeId> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let leaders: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| n.raft.status() == Status::Leader)
                .map(|n| n.raft.id())
                .collect();
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }

            anyhow::ensure!(
                std::time::Instant::now() < deadline,
                "no single leader within {timeout:?}, saw {leaders:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `pred` holds for the node, polling its metrics.
    pub async fn wait_node(
        &self,
        id: NodeId,
        timeout: Duration,
        waiting_for: &str,
        pred: impl Fn(&raftling::RaftMetrics) -> bool,
    ) -> anyhow::Result<raftling::RaftMetrics> {
        self.node(id)
            .raft
            .wait(timeout)
            .metrics(pred, waiting_for)
            .await
            .context(format!("node {id}"))
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.raft.shutdown().await;
        }
    }
}

/// Applied payloads excluding leadership nops.
pub fn payloads(sm: &MemStateMachine) -> Vec<Vec<u8>> {
    sm.applied_data()
        .into_iter()
        .filter(|d| !d.is_empty())
        .map(|d| d.to_vec())
        .collect()
}
