use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::oneshot;

use crate::channel::{Inbound, Proposal, TickKind};
use crate::config::Config;
use crate::core::tick::TickControl;
use crate::engine::Engine;
use crate::error::ProposeError;
use crate::log::{RaftLog, Watermarks};
use crate::message::{EntryType, Message, MessageType, RejectType, Snapshot};
use crate::node::Cluster;
use crate::snapshot::Snapshotter;
use crate::state::{Listeners, NodeState, Status};
use crate::storage;
use crate::wal::Wal;
use crate::Entry;

struct Fixture {
    _dir: TempDir,
    engine: Engine,
}

fn entry(term: u64, index: u64) -> Entry {
    Entry::new(
        EntryType::Normal,
        term,
        index,
        Bytes::from(format!("e-{term}-{index}")),
    )
}

fn fixture(n: usize) -> Fixture {
    fixture_with_snapshot(n, None)
}

fn fixture_with_snapshot(n: usize, snapshot: Option<Snapshot>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let members: Vec<String> = (1..=n as u64).map(|i| format!("{i}@127.0.0.1:{}", 9000 + i)).collect();
    let config = Config {
        id: 1,
        cluster: members.join(","),
        data_dir: dir.path().display().to_string(),
        election_tick_min: 3,
        election_tick_max: 3,
        ..Config::default()
    }
    .validate()
    .unwrap();
    let config = Arc::new(config);

    let cluster = Arc::new(Cluster::from_config(&config).unwrap());
    let wal = Arc::new(Wal::open(config.wal_dir(), config.wal_segment_bytes).unwrap());
    let snapshotter = Arc::new(
        Snapshotter::open(config.snapshot_dir(), true, config.min_snapshots_retention).unwrap(),
    );
    if let Some(s) = &snapshot {
        snapshotter.save(s).unwrap();
    }

    let store = storage::open(config.storage_type, config.ring_buffer_size, wal);
    let marks = Arc::new(Watermarks::default());
    let mut log = RaftLog::new(store, marks);
    let meta = snapshotter.latest().unwrap_or_default();
    log.recover(meta, meta.index);

    let ticks = Arc::new(TickControl::new(config.clone()));
    let listeners = Arc::new(Listeners::default());
    let mut state = NodeState::new(config.clone(), cluster, ticks.clone(), listeners);
    state.set_term(meta.term);

    Fixture {
        _dir: dir,
        engine: Engine::new(config, state, log, snapshotter, ticks),
    }
}

/// Walk a 3-node fixture through pre-vote and vote to leadership.
fn elect(engine: &mut Engine) {
    let term = engine.state.term();
    engine.handle_tick(TickKind::Election);
    assert_eq!(engine.state.status(), Status::PreCandidate);

    let grant = Message::new(MessageType::PrevoteResponse, 2, 1, term + 1);
    engine.handle_inbound(Inbound::Message(grant));
    assert_eq!(engine.state.status(), Status::Candidate);

    let mut vote = Message::new(MessageType::VoteResponse, 2, 1, engine.state.term());
    vote.reject = false;
    engine.handle_inbound(Inbound::Message(vote));
    assert_eq!(engine.state.status(), Status::Leader);
}

fn append_from(leader: u64, term: u64, prev: (u64, u64), entries: Vec<Entry>, commit: u64) -> Message {
    let mut m = Message::new(MessageType::AppendEntriesRequest, leader, 1, term);
    m.index = prev.0;
    m.log_term = prev.1;
    m.entries = entries;
    m.commit_index = commit;
    m
}

#[test]
fn single_node_elects_and_commits_itself() {
    let mut f = fixture(1);
    f.engine.handle_tick(TickKind::Election);

    assert_eq!(f.engine.state.status(), Status::Leader);
    assert_eq!(f.engine.state.term(), 1);
    assert_eq!(f.engine.state.leader(), Some(1));

    // The leadership nop commits instantly at quorum 1.
    let ready = f.engine.poll_ready().unwrap();
    assert_eq!(ready.entries.len(), 1);
    assert_eq!(ready.entries[0].term, 1);
    assert_eq!(ready.committed_entries.len(), 1);
    assert_eq!(f.engine.log.committed(), 1);
}

#[test]
fn single_node_propose_commits_and_ships_apply() {
    let mut f = fixture(1);
    f.engine.handle_tick(TickKind::Election);
    let _ = f.engine.poll_ready().unwrap();

    let (tx, mut rx) = oneshot::channel();
    f.engine.handle_proposal(Proposal {
        data: Bytes::from_static(b"x"),
        attachments: BTreeMap::new(),
        responder: tx,
    });

    assert_eq!(f.engine.log.committed(), 2);
    let ready = f.engine.poll_ready().unwrap();
    assert_eq!(ready.entries.len(), 1);
    assert_eq!(ready.committed_entries.len(), 1);
    assert_eq!(ready.committed_entries[0].data, Bytes::from_static(b"x"));
    // The future resolves in the apply loop, not here.
    assert!(rx.try_recv().is_err());
    assert_eq!(ready.responders.len(), 1);
}

#[test]
fn three_node_election_runs_prevote_then_vote() {
    let mut f = fixture(3);

    f.engine.handle_tick(TickKind::Election);
    assert_eq!(f.engine.state.status(), Status::PreCandidate);
    // Pre-vote probes do not bump the term.
    assert_eq!(f.engine.state.term(), 0);
    let ready = f.engine.poll_ready().unwrap();
    let kinds: Vec<MessageType> = ready.messages.iter().map(|m| m.msg_type()).collect();
    assert_eq!(kinds, vec![MessageType::Prevote, MessageType::Prevote]);
    assert_eq!(ready.messages[0].term, 1);

    let grant = Message::new(MessageType::PrevoteResponse, 2, 1, 1);
    f.engine.handle_inbound(Inbound::Message(grant));
    assert_eq!(f.engine.state.status(), Status::Candidate);
    assert_eq!(f.engine.state.term(), 1);

    let ready = f.engine.poll_ready().unwrap();
    let kinds: Vec<MessageType> = ready.messages.iter().map(|m| m.msg_type()).collect();
    assert_eq!(kinds, vec![MessageType::Vote, MessageType::Vote]);

    let mut vote = Message::new(MessageType::VoteResponse, 2, 1, 1);
    vote.reject = false;
    f.engine.handle_inbound(Inbound::Message(vote));
    assert_eq!(f.engine.state.status(), Status::Leader);

    // Authority is asserted with an empty append under the new term.
    let ready = f.engine.poll_ready().unwrap();
    assert_eq!(ready.entries.len(), 1);
    assert!(ready.entries[0].data.is_empty());
    assert!(ready
        .messages
        .iter()
        .all(|m| m.msg_type() == MessageType::AppendEntriesRequest));
}

#[test]
fn follower_accepts_append_and_advances_commit() {
    let mut f = fixture(3);

    let m = append_from(2, 1, (0, 0), vec![entry(1, 1), entry(1, 2), entry(1, 3)], 2);
    f.engine.handle_inbound(Inbound::Message(m));

    assert_eq!(f.engine.state.status(), Status::Follower);
    assert_eq!(f.engine.state.leader(), Some(2));
    assert_eq!(f.engine.log.last_index(), 3);
    assert_eq!(f.engine.log.committed(), 2);

    let ready = f.engine.poll_ready().unwrap();
    let ack = ready.messages.last().unwrap();
    assert_eq!(ack.msg_type(), MessageType::AppendEntriesResponse);
    assert!(!ack.reject);
    assert_eq!(ack.index, 3);
}

#[test]
fn follower_truncates_conflicting_suffix() {
    let mut f = fixture(3);

    // Old leader at term 1 replicated three entries, two committed.
    let m = append_from(2, 1, (0, 0), vec![entry(1, 1), entry(1, 2), entry(1, 3)], 2);
    f.engine.handle_inbound(Inbound::Message(m));
    let _ = f.engine.poll_ready();

    // New leader at term 2 overwrites the uncommitted index 3.
    let m = append_from(3, 2, (2, 1), vec![entry(2, 3)], 3);
    f.engine.handle_inbound(Inbound::Message(m));

    assert_eq!(f.engine.log.last_index(), 3);
    assert_eq!(f.engine.log.term(3).unwrap(), 2);
    assert_eq!(f.engine.log.committed(), 3);

    let ready = f.engine.poll_ready().unwrap();
    let ack = ready.messages.last().unwrap();
    assert!(!ack.reject);
    assert_eq!(ack.index, 3);
    // The replacement entry ships for persistence again.
    assert_eq!(ready.entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3]);
    assert_eq!(ready.entries[0].term, 2);
}

#[test]
fn append_rejects_are_typed() {
    let mut f = fixture(3);
    let m = append_from(2, 1, (0, 0), vec![entry(1, 1), entry(1, 2)], 0);
    f.engine.handle_inbound(Inbound::Message(m));
    let _ = f.engine.poll_ready();

    // Beyond the log end: non-sequential.
    let m = append_from(2, 1, (5, 1), vec![entry(1, 6)], 0);
    f.engine.handle_inbound(Inbound::Message(m));
    let ready = f.engine.poll_ready().unwrap();
    let reject = ready.messages.last().unwrap();
    assert!(reject.reject);
    assert_eq!(reject.reject_type(), RejectType::LogNonSequential);
    assert_eq!(reject.reject_hint, 2);

    // Mismatched prev term.
    let m = append_from(2, 1, (2, 9), vec![entry(1, 3)], 0);
    f.engine.handle_inbound(Inbound::Message(m));
    let ready = f.engine.poll_ready().unwrap();
    let reject = ready.messages.last().unwrap();
    assert!(reject.reject);
    assert_eq!(reject.reject_type(), RejectType::LogNotMatch);

    // Stale term.
    let m = append_from(9, 0, (0, 0), vec![], 0);
    f.engine.handle_inbound(Inbound::Message(m));
    let ready = f.engine.poll_ready().unwrap();
    let reject = ready.messages.last().unwrap();
    assert!(reject.reject);
    assert_eq!(reject.reject_type(), RejectType::LowTerm);
}

#[test]
fn no_commit_across_terms_until_own_term_replicates() {
    let mut f = fixture(3);

    // Five entries from an old term-2 leader, none committed.
    let m = append_from(
        2,
        2,
        (0, 0),
        (1..=5).map(|i| entry(2, i)).collect(),
        0,
    );
    f.engine.handle_inbound(Inbound::Message(m));
    let _ = f.engine.poll_ready();

    // This node takes over at term 3; nop lands at index 6.
    elect(&mut f.engine);
    assert_eq!(f.engine.state.term(), 3);
    assert_eq!(f.engine.log.last_index(), 6);
    let _ = f.engine.poll_ready();

    // A quorum matches the old-term entry 5, but it must not commit.
    let mut ack = Message::new(MessageType::AppendEntriesResponse, 2, 1, 3);
    ack.index = 5;
    f.engine.handle_inbound(Inbound::Message(ack));
    assert_eq!(f.engine.log.committed(), 0);

    // Once the term-3 nop replicates, everything beneath commits too.
    let mut ack = Message::new(MessageType::AppendEntriesResponse, 2, 1, 3);
    ack.index = 6;
    f.engine.handle_inbound(Inbound::Message(ack));
    assert_eq!(f.engine.log.committed(), 6);
}

#[test]
fn reject_hint_fast_backoff() {
    let mut f = fixture(3);
    elect(&mut f.engine);
    let _ = f.engine.poll_ready();

    let peer = f.engine.state.cluster().get(2).unwrap().clone();
    peer.set_next_index(9);

    let mut reject = Message::new(MessageType::AppendEntriesResponse, 2, 1, f.engine.state.term());
    reject.reject = true;
    reject.reject_type = RejectType::LogNonSequential as i32;
    reject.reject_hint = 0;
    f.engine.handle_inbound(Inbound::Message(reject));

    // next_index jumped straight to hint + 1.
    assert_eq!(peer.next_index(), 1);
    let ready = f.engine.poll_ready().unwrap();
    let retry = ready.messages.last().unwrap();
    assert_eq!(retry.msg_type(), MessageType::AppendEntriesRequest);
    assert_eq!(retry.index, 0);
}

#[test]
fn leader_steps_down_after_two_lease_misses() {
    let mut f = fixture(3);
    elect(&mut f.engine);

    f.engine.handle_tick(TickKind::Lease);
    assert_eq!(f.engine.state.status(), Status::Leader);
    f.engine.handle_tick(TickKind::Lease);
    assert_eq!(f.engine.state.status(), Status::Follower);
}

#[test]
fn heartbeat_responses_keep_the_lease() {
    let mut f = fixture(3);
    elect(&mut f.engine);

    for _ in 0..4 {
        let mut hb = Message::new(MessageType::HeartbeatResponse, 2, 1, f.engine.state.term());
        hb.index = f.engine.log.last_index();
        f.engine.handle_inbound(Inbound::Message(hb));
        f.engine.handle_tick(TickKind::Lease);
        assert_eq!(f.engine.state.status(), Status::Leader);
    }
}

#[test]
fn leader_falls_back_to_snapshot_for_compacted_peer() {
    let snapshot = Snapshot::new(10, 2, Bytes::from_static(b"compact-state"));
    let mut f = fixture_with_snapshot(3, Some(snapshot));
    assert_eq!(f.engine.log.first_index(), 11);

    elect(&mut f.engine);
    let _ = f.engine.poll_ready();

    // The peer reports a log far behind the snapshot boundary.
    let mut reject = Message::new(MessageType::AppendEntriesResponse, 2, 1, f.engine.state.term());
    reject.reject = true;
    reject.reject_type = RejectType::LogNotMatch as i32;
    reject.reject_hint = 3;
    f.engine.handle_inbound(Inbound::Message(reject));

    let ready = f.engine.poll_ready().unwrap();
    let m = ready.messages.last().unwrap();
    assert_eq!(m.msg_type(), MessageType::SnapshotRequest);
    let snap = m.snapshot.as_ref().unwrap();
    assert_eq!(snap.metadata().index, 10);
    assert_eq!(f.engine.state.cluster().get(2).unwrap().pending_snapshot(), 10);
}

#[test]
fn follower_installs_snapshot_then_appends_past_it() {
    let mut f = fixture(3);

    let mut m = Message::new(MessageType::SnapshotRequest, 2, 1, 1);
    m.snapshot = Some(Snapshot::new(1000, 7, Bytes::from_static(b"state")));
    f.engine.handle_inbound(Inbound::Message(m));

    assert_eq!(f.engine.log.first_index(), 1001);
    assert_eq!(f.engine.log.last_index(), 1000);
    assert_eq!(f.engine.log.committed(), 1000);

    let ready = f.engine.poll_ready().unwrap();
    assert!(ready.snapshot.is_some());
    let ack = ready.messages.last().unwrap();
    assert_eq!(ack.msg_type(), MessageType::SnapshotResponse);
    assert_eq!(ack.index, 1000);

    // Replication resumes right after the boundary.
    let m = append_from(2, 7, (1000, 7), vec![entry(7, 1001)], 1001);
    f.engine.handle_inbound(Inbound::Message(m));
    assert_eq!(f.engine.log.last_index(), 1001);
    let ready = f.engine.poll_ready().unwrap();
    let ack = ready.messages.last().unwrap();
    assert!(!ack.reject);
    assert_eq!(ack.index, 1001);
}

#[test]
fn follower_bounces_proposals_to_the_leader() {
    let mut f = fixture(3);
    let m = append_from(2, 1, (0, 0), vec![entry(1, 1)], 0);
    f.engine.handle_inbound(Inbound::Message(m));

    let (tx, mut rx) = oneshot::channel();
    f.engine.handle_proposal(Proposal {
        data: Bytes::from_static(b"nope"),
        attachments: BTreeMap::new(),
        responder: tx,
    });

    assert_eq!(
        rx.try_recv().unwrap(),
        Err(ProposeError::NotLeader { leader: Some(2) })
    );
}

#[test]
fn higher_term_message_forces_step_down() {
    let mut f = fixture(3);
    elect(&mut f.engine);
    let term = f.engine.state.term();

    let m = append_from(3, term + 5, (0, 0), vec![], 0);
    f.engine.handle_inbound(Inbound::Message(m));

    assert_eq!(f.engine.state.status(), Status::Follower);
    assert_eq!(f.engine.state.term(), term + 5);
    assert_eq!(f.engine.state.leader(), Some(3));
}

#[test]
fn prevote_denied_inside_leader_lease() {
    let mut f = fixture(3);
    // Fresh leader contact: the election timer was just reset.
    let m = append_from(2, 1, (0, 0), vec![entry(1, 1)], 0);
    f.engine.handle_inbound(Inbound::Message(m));
    let _ = f.engine.poll_ready();

    let mut probe = Message::new(MessageType::Prevote, 3, 1, 2);
    probe.index = 1;
    probe.log_term = 1;
    f.engine.handle_inbound(Inbound::Message(probe));

    let ready = f.engine.poll_ready().unwrap();
    let reply = ready.messages.last().unwrap();
    assert_eq!(reply.msg_type(), MessageType::PrevoteResponse);
    assert!(reply.reject);
}

#[test]
fn vote_recorded_once_per_term() {
    let mut f = fixture(3);

    let mut ask = Message::new(MessageType::Vote, 2, 1, 1);
    ask.index = 0;
    ask.log_term = 0;
    f.engine.handle_inbound(Inbound::Message(ask.clone()));
    assert_eq!(f.engine.state.vote_for(), Some(2));

    // A competing candidate in the same term is refused.
    let mut other = Message::new(MessageType::Vote, 3, 1, 1);
    other.index = 5;
    other.log_term = 1;
    f.engine.handle_inbound(Inbound::Message(other));

    let ready = f.engine.poll_ready().unwrap();
    let replies: Vec<&Message> = ready
        .messages
        .iter()
        .filter(|m| m.msg_type() == MessageType::VoteResponse)
        .collect();
    assert_eq!(replies.len(), 2);
    assert!(!replies[0].reject);
    assert!(replies[1].reject);
    // The repeat grant stays idempotent.
    f.engine.handle_inbound(Inbound::Message(ask));
    assert_eq!(f.engine.state.vote_for(), Some(2));
}

#[test]
fn rejected_advance_rolls_back_and_reships() {
    let mut f = fixture(1);
    f.engine.handle_tick(TickKind::Election);
    let ready = f.engine.poll_ready().unwrap();
    assert_eq!(ready.entries.len(), 1);

    // The WAL rejected the batch: the engine must ship it again.
    f.engine.handle_advance(crate::channel::Advance {
        stable_index: 0,
        applied_enqueued: 0,
        accepted: false,
        responders: ready.responders,
        epoch: ready.epoch,
    });

    let retry = f.engine.poll_ready().unwrap();
    assert_eq!(retry.entries.len(), 1);
    assert_eq!(retry.entries[0].index, 1);
    assert_eq!(retry.committed_entries.len(), 1);
}

#[test]
fn peer_disconnect_updates_group_state() {
    let mut f = fixture(3);
    f.engine.state.refresh_group_state(true);
    assert_eq!(f.engine.state.group_state(), crate::node::GroupState::Stable);

    f.engine.handle_inbound(Inbound::PeerState { id: 2, connected: false });
    assert_eq!(f.engine.state.group_state(), crate::node::GroupState::Partial);

    f.engine.handle_inbound(Inbound::PeerState { id: 3, connected: false });
    assert_eq!(
        f.engine.state.group_state(),
        crate::node::GroupState::Unavailable
    );

    f.engine.handle_inbound(Inbound::PeerState { id: 2, connected: true });
    assert_eq!(f.engine.state.group_state(), crate::node::GroupState::Partial);
}
