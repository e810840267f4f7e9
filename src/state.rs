//! Authoritative election state and role transitions.
//!
//! Mutated only by the raft loop; other loops observe roles through the
//! published metrics and the shared `NodeInfo` atomics.

use std::collections::HashMap;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::TickKind;
use crate::config::Config;
use crate::core::tick::TickControl;
use crate::node::{Cluster, GroupState, ReplayState};
use crate::NodeId;

/// Node role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Follower => write!(f, "follower"),
            Status::PreCandidate => write!(f, "pre-candidate"),
            Status::Candidate => write!(f, "candidate"),
            Status::Leader => write!(f, "leader"),
        }
    }
}

type ElectionCallback = Box<dyn Fn(Status) + Send + Sync>;
type GroupStateCallback = Box<dyn Fn(GroupState, GroupState) + Send + Sync>;

/// Registered observers. A failing listener is logged and isolated; it
/// never affects the others or the engine.
#[derive(Default)]
pub struct Listeners {
    election: Mutex<Vec<ElectionCallback>>,
    group_state: Mutex<Vec<GroupStateCallback>>,
}

impl Listeners {
    pub fn add_election(&self, listener: ElectionCallback) {
        self.election.lock().push(listener);
    }

    pub fn add_group_state(&self, listener: GroupStateCallback) {
        self.group_state.lock().push(listener);
    }

    pub fn notify_election(&self, status: Status) {
        for listener in self.election.lock().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                tracing::error!(%status, "election listener panicked");
            }
        }
    }

    pub fn notify_group_state(&self, from: GroupState, to: GroupState) {
        for listener in self.group_state.lock().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(from, to))).is_err() {
                tracing::error!(%from, %to, "group state listener panicked");
            }
        }
    }
}

/// Leader-only cursor for the next proposal offset.
#[derive(Clone, Copy, Debug)]
pub struct NextOffset {
    offset: u64,
}

impl NextOffset {
    pub fn new(last_index: u64) -> Self {
        NextOffset { offset: last_index }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Claim the next log index.
    pub fn advance(&mut self) -> u64 {
        self.offset += 1;
        self.offset
    }
}

/// Term, vote, leader and role, plus the election bookkeeping that goes
/// with them (vote tallies, lease observations, proposal cursor).
pub struct NodeState {
    config: Arc<Config>,
    cluster: Arc<Cluster>,
    ticks: Arc<TickControl>,
    listeners: Arc<Listeners>,

    term: u64,
    vote_for: Option<NodeId>,
    leader: Option<NodeId>,
    status: Status,
    group_state: GroupState,

    /// Vote tally for the current pre-vote or vote round.
    votes: HashMap<NodeId, bool>,
    /// Peers whose heartbeat response arrived inside the lease window.
    leased: HashSet<NodeId>,
    /// Consecutive lease checks without quorum support.
    lease_misses: u32,
    next_offset: Option<NextOffset>,
}

impl NodeState {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<Cluster>,
        ticks: Arc<TickControl>,
        listeners: Arc<Listeners>,
    ) -> Self {
        NodeState {
            config,
            cluster,
            ticks,
            listeners,
            term: 0,
            vote_for: None,
            leader: None,
            status: Status::Follower,
            group_state: GroupState::Unavailable,
            votes: HashMap::new(),
            leased: HashSet::new(),
            lease_misses: 0,
            next_offset: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.cluster.self_id()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn quorum(&self) -> usize {
        self.cluster.quorum()
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn set_term(&mut self, term: u64) {
        debug_assert!(term >= self.term, "term never decreases");
        self.term = term;
    }

    pub fn vote_for(&self) -> Option<NodeId> {
        self.vote_for
    }

    pub fn vote(&mut self, node: NodeId) {
        self.vote_for = Some(node);
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_leader(&self) -> bool {
        self.status == Status::Leader
    }

    pub fn group_state(&self) -> GroupState {
        self.group_state
    }

    pub fn next_offset_mut(&mut self) -> Option<&mut NextOffset> {
        self.next_offset.as_mut()
    }

    /// Whether this node heard from a live leader within the election
    /// window; used to refuse disruptive pre-votes.
    pub fn leader_in_lease(&self) -> bool {
        self.leader.is_some() && self.ticks.election_elapsed() < self.config.election_tick_min
    }

    /// Record a (pre-)vote response and return `(granted, rejected)`.
    pub fn record_vote(&mut self, from: NodeId, granted: bool) -> (usize, usize) {
        self.votes.entry(from).or_insert(granted);
        let yes = self.votes.values().filter(|g| **g).count();
        let no = self.votes.len() - yes;
        (yes, no)
    }

    pub fn record_lease(&mut self, from: NodeId) {
        self.leased.insert(from);
    }

    /// One lease window elapsed: count support, step down after two
    /// consecutive misses. Returns true when leadership must be dropped.
    pub fn lease_check(&mut self) -> bool {
        let supported = self.leased.len() + 1;
        self.leased.clear();
        if supported < self.quorum() {
            self.lease_misses += 1;
        } else {
            self.lease_misses = 0;
        }
        self.lease_misses >= 2
    }

    pub fn become_follower(&mut self, term: u64, leader: Option<NodeId>) {
        if self.status == Status::Leader {
            self.ticks.add_listener(TickKind::Election);
            self.ticks.remove_listener(TickKind::Heartbeat);
            self.ticks.remove_listener(TickKind::Lease);
        }

        self.votes.clear();
        self.leased.clear();
        self.lease_misses = 0;
        // A vote cast in the current term must survive, or two candidates
        // could both collect it.
        if term > self.term {
            self.vote_for = None;
        }
        self.next_offset = None;
        let was = self.status;
        self.status = Status::Follower;
        self.term = term;
        self.leader = leader;
        self.ticks.reset(TickKind::Election);

        tracing::debug!(
            id = self.id(),
            term = self.term,
            leader = ?self.leader,
            "become follower"
        );
        if was != Status::Follower {
            self.listeners.notify_election(Status::Follower);
        }
    }

    /// Pre-vote probe: no term bump, leader forgotten.
    pub fn become_pre_candidate(&mut self) {
        self.votes.clear();
        self.leader = None;
        self.status = Status::PreCandidate;
        self.ticks.reset(TickKind::Election);
        tracing::debug!(id = self.id(), term = self.term, "become pre-candidate");
    }

    pub fn become_candidate(&mut self) {
        self.votes.clear();
        self.term += 1;
        self.vote_for = Some(self.id());
        self.status = Status::Candidate;
        self.ticks.reset(TickKind::Election);
        tracing::info!(id = self.id(), term = self.term, "become candidate");
    }

    /// Take leadership. `last_index` is the low-water-mark candidate;
    /// `replayed` reports whether the state machine is already caught up
    /// (empty log, snapshot boundary at last entry, or applied == last).
    pub fn become_leader(&mut self, last_index: u64, replayed: bool) {
        if self.status == Status::Leader {
            tracing::warn!(id = self.id(), "already leader");
            return;
        }

        tracing::info!(id = self.id(), term = self.term, last_index, "become leader");
        self.votes.clear();
        self.vote_for = None;
        self.ticks.remove_listener(TickKind::Election);
        self.ticks.add_listener(TickKind::Heartbeat);
        self.ticks.add_listener(TickKind::Lease);
        self.leased.clear();
        self.lease_misses = 0;
        self.next_offset = Some(NextOffset::new(last_index));

        for peer in self.cluster.peers() {
            peer.set_next_index(last_index + 1);
            peer.set_match_index(0);
            peer.set_pending_snapshot(0);
        }

        self.listeners.notify_election(Status::Leader);

        let local = self.cluster.local();
        local.set_replay_state(ReplayState::Replaying);
        if replayed {
            local.set_replay_state(ReplayState::Replayed);
            tracing::info!(id = self.id(), "leader state machine already replayed");
        }

        self.status = Status::Leader;
        self.leader = Some(self.id());
    }

    /// Recompute group reachability and notify on transitions (or when
    /// forced).
    pub fn refresh_group_state(&mut self, force: bool) {
        let record = self.group_state;
        self.group_state = self.cluster.group_state();
        if record != self.group_state || force {
            tracing::info!(from = %record, to = %self.group_state, "group state");
            self.listeners.notify_group_state(record, self.group_state);
        }
    }
}
