//! Cluster membership and per-peer runtime progress.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::error::ConfigError;
use crate::NodeId;

/// Whether the local state machine has caught up with the watermark
/// captured at the last role transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplayState {
    Replaying = 0,
    Replayed = 1,
}

/// Reachability of the group as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupState {
    /// Every peer reachable.
    Stable,
    /// At least a quorum reachable.
    Partial,
    /// Fewer than a quorum reachable.
    Unavailable,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Stable => write!(f, "stable"),
            GroupState::Partial => write!(f, "partial"),
            GroupState::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Identity and runtime progress for one cluster member.
///
/// The raft loop is the sole writer of replication progress; the apply
/// loop owns `applying` and `replay_state`. Cross-loop readers rely on
/// the atomics, there is no lock.
#[derive(Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    next_index: AtomicU64,
    match_index: AtomicU64,
    /// Mirror of the node's committed index, refreshed by the raft loop.
    committed: AtomicU64,
    /// Snapshot index in flight to this peer; `0` when none.
    pending_snapshot: AtomicU64,
    disconnected: AtomicBool,
    applying: AtomicBool,
    replay_state: AtomicU8,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: String) -> Self {
        NodeInfo {
            id,
            address,
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            pending_snapshot: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
            applying: AtomicBool::new(false),
            replay_state: AtomicU8::new(ReplayState::Replaying as u8),
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, index: u64) {
        self.next_index.store(index, Ordering::Release);
    }

    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::Acquire)
    }

    pub fn set_match_index(&self, index: u64) {
        self.match_index.store(index, Ordering::Release);
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn set_committed(&self, index: u64) {
        self.committed.store(index, Ordering::Release);
    }

    pub fn pending_snapshot(&self) -> u64 {
        self.pending_snapshot.load(Ordering::Acquire)
    }

    pub fn set_pending_snapshot(&self, index: u64) {
        self.pending_snapshot.store(index, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::Release);
    }

    pub fn is_applying(&self) -> bool {
        self.applying.load(Ordering::Acquire)
    }

    pub fn set_applying(&self, applying: bool) {
        self.applying.store(applying, Ordering::Release);
    }

    pub fn replay_state(&self) -> ReplayState {
        match self.replay_state.load(Ordering::Acquire) {
            0 => ReplayState::Replaying,
            _ => ReplayState::Replayed,
        }
    }

    pub fn set_replay_state(&self, state: ReplayState) {
        self.replay_state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({}@{})", self.id, self.address)
    }
}

/// Immutable `id -> NodeInfo` mapping built from configuration.
#[derive(Debug, Clone)]
pub struct Cluster {
    self_id: NodeId,
    nodes: BTreeMap<NodeId, Arc<NodeInfo>>,
}

impl Cluster {
    pub fn from_config(config: &Config) -> Result<Cluster, ConfigError> {
        let members = config.parse_cluster()?;
        let nodes = members
            .into_iter()
            .map(|(id, addr)| (id, Arc::new(NodeInfo::new(id, addr))))
            .collect();
        Ok(Cluster {
            self_id: config.id,
            nodes,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn quorum(&self) -> usize {
        (self.nodes.len() >> 1) + 1
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<NodeInfo>> {
        self.nodes.get(&id)
    }

    /// The local node's info.
    pub fn local(&self) -> &Arc<NodeInfo> {
        &self.nodes[&self.self_id]
    }

    /// Every member except self.
    pub fn peers(&self) -> impl Iterator<Item = &Arc<NodeInfo>> {
        let self_id = self.self_id;
        self.nodes.values().filter(move |n| n.id != self_id)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers().map(|n| n.id).collect()
    }

    /// `1 + reachable peers`, then the derived [`GroupState`].
    pub fn group_state(&self) -> GroupState {
        let available = 1 + self.peers().filter(|p| !p.is_disconnected()).count();
        if available == self.nodes.len() {
            GroupState::Stable
        } else if available >= self.quorum() {
            GroupState::Partial
        } else {
            GroupState::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_of(n: usize) -> Cluster {
        let members: Vec<String> = (1..=n).map(|i| format!("{i}@127.0.0.1:{}", 9000 + i)).collect();
        let config = Config {
            id: 1,
            cluster: members.join(","),
            ..Config::default()
        };
        Cluster::from_config(&config).unwrap()
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(cluster_of(1).quorum(), 1);
        assert_eq!(cluster_of(3).quorum(), 2);
        assert_eq!(cluster_of(4).quorum(), 3);
        assert_eq!(cluster_of(5).quorum(), 3);
    }

    #[test]
    fn peers_excludes_self() {
        let cluster = cluster_of(3);
        assert_eq!(cluster.peer_ids(), vec![2, 3]);
        assert_eq!(cluster.local().id, 1);
    }

    #[test]
    fn group_state_derivation() {
        let cluster = cluster_of(3);
        assert_eq!(cluster.group_state(), GroupState::Stable);

        cluster.get(2).unwrap().set_disconnected(true);
        assert_eq!(cluster.group_state(), GroupState::Partial);

        cluster.get(3).unwrap().set_disconnected(true);
        assert_eq!(cluster.group_state(), GroupState::Unavailable);
    }

    #[test]
    fn replay_state_flips() {
        let info = NodeInfo::new(1, "h:1".to_string());
        assert_eq!(info.replay_state(), ReplayState::Replaying);
        info.set_replay_state(ReplayState::Replayed);
        assert_eq!(info.replay_state(), ReplayState::Replayed);
    }
}
