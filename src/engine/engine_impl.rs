//! The raft transition engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::channel::{Advance, Inbound, Proposal, Responder, TickKind};
use crate::config::Config;
use crate::core::tick::TickControl;
use crate::engine::Ready;
use crate::error::ProposeError;
use crate::log::RaftLog;
use crate::message::{EntryType, HardState, Message, MessageType, RejectType};
use crate::snapshot::Snapshotter;
use crate::state::{NodeState, Status};
use crate::Entry;
use crate::NodeId;

/// Pure raft transitions over `(NodeState, RaftLog)`.
///
/// Every input mutates local state and accumulates outgoing messages,
/// entries to persist and entries to apply; [`Engine::poll_ready`] drains
/// the accumulation into one [`Ready`] batch. The engine touches no
/// sockets and no disk besides reading snapshots for lagging peers.
pub struct Engine {
    config: Arc<Config>,
    pub(crate) state: NodeState,
    pub(crate) log: RaftLog,
    snapshotter: Arc<Snapshotter>,
    ticks: Arc<TickControl>,

    msgs: Vec<Message>,
    hard_state_dirty: bool,
    pending_snapshot: Option<crate::message::Snapshot>,
    /// Proposal responders waiting for their entry to apply.
    pending_responders: BTreeMap<u64, Responder>,

    /// Highest index included in any shipped `Ready` for persistence.
    shipped_persist: u64,
    /// Highest index shipped to the apply loop.
    shipped_apply: u64,
    /// Watermarks acknowledged by the group-commit loop; rejected
    /// batches roll the shipped marks back here.
    acked_persist: u64,
    acked_apply: u64,
    /// Bumped on every suffix truncation or snapshot install, so stale
    /// advances cannot mark overwritten indices stable.
    epoch: u64,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        state: NodeState,
        log: RaftLog,
        snapshotter: Arc<Snapshotter>,
        ticks: Arc<TickControl>,
    ) -> Self {
        let stable = log.stable();
        let applied = log.applied();
        Engine {
            config,
            state,
            log,
            snapshotter,
            ticks,
            msgs: Vec::new(),
            hard_state_dirty: false,
            pending_snapshot: None,
            pending_responders: BTreeMap::new(),
            shipped_persist: stable,
            shipped_apply: applied,
            acked_persist: stable,
            acked_apply: applied,
            epoch: 0,
        }
    }

    fn id(&self) -> NodeId {
        self.state.id()
    }

    fn send(&mut self, message: Message) {
        self.msgs.push(message);
    }

    /// Step down (or yield) to `term`, failing pending proposals.
    fn step_down(&mut self, term: u64, leader: Option<NodeId>) {
        let was_leader = self.state.is_leader();
        self.hard_state_dirty = true;
        self.state.become_follower(term, leader);
        if was_leader {
            let leader = self.state.leader();
            for (_, responder) in std::mem::take(&mut self.pending_responders) {
                let _ = responder.send(Err(ProposeError::NotLeader { leader }));
            }
        }
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    pub fn handle_tick(&mut self, kind: TickKind) {
        match kind {
            TickKind::Election => self.on_election_timeout(),
            TickKind::Heartbeat => self.on_heartbeat_tick(),
            TickKind::Lease => self.on_lease_tick(),
        }
    }

    pub fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => self.handle_message(message),
            Inbound::PeerState { id, connected } => self.on_peer_state(id, connected),
            Inbound::SnapshotBuilt { index } => {
                if let Some(meta) = self.snapshotter.latest() {
                    self.log.note_snapshot(meta);
                }
                if let Err(e) = self.log.compact(index) {
                    tracing::error!(index, error = %e, "log compaction failed");
                }
            }
        }
    }

    pub fn handle_proposal(&mut self, proposal: Proposal) {
        if !self.state.is_leader() {
            let _ = proposal.responder.send(Err(ProposeError::NotLeader {
                leader: self.state.leader(),
            }));
            return;
        }

        let term = self.state.term();
        let next = self.state.next_offset_mut().expect("leader has offset cursor");
        let index = next.advance();

        let mut entry = Entry::new(EntryType::Normal, term, index, proposal.data);
        entry.attachments = proposal.attachments.into_iter().collect();

        match self.log.append(std::slice::from_ref(&entry)) {
            Ok(()) => {
                tracing::debug!(index, term, "proposal accepted");
                self.pending_responders.insert(index, proposal.responder);
                self.broadcast_append();
                self.maybe_advance_commit();
            }
            Err(e) => {
                tracing::error!(index, error = %e, "proposal append failed");
                let _ = proposal.responder.send(Err(ProposeError::Unavailable));
            }
        }
    }

    /// Group-commit acknowledgement for one shipped batch.
    pub fn handle_advance(&mut self, advance: Advance) {
        if advance.accepted {
            // A batch persisted before a truncation covered indices that
            // no longer exist; only same-epoch acknowledgements move the
            // persistence watermark.
            if advance.epoch == self.epoch {
                let stable = advance.stable_index.min(self.log.last_index());
                self.log.stable_to(stable);
                self.acked_persist = self.acked_persist.max(stable);
            }
            self.acked_apply = self.acked_apply.max(advance.applied_enqueued);
        } else {
            tracing::warn!(
                acked = self.acked_persist,
                "ready batch rejected, retrying from acknowledged watermark"
            );
            self.shipped_persist = self.acked_persist;
            self.shipped_apply = self.acked_apply;
            for (index, responder) in advance.responders {
                self.pending_responders.insert(index, responder);
            }
        }
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    fn on_election_timeout(&mut self) {
        if self.state.is_leader() {
            return;
        }

        self.state.become_pre_candidate();
        self.state.record_vote(self.id(), true);
        if self.state.quorum() == 1 {
            self.campaign();
            return;
        }

        let term = self.state.term() + 1;
        let (last, last_term) = (self.log.last_index(), self.log.last_term());
        for id in self.state.cluster().peer_ids() {
            let mut m = Message::new(MessageType::Prevote, self.id(), id, term);
            m.index = last;
            m.log_term = last_term;
            self.send(m);
        }
    }

    fn on_heartbeat_tick(&mut self) {
        if !self.state.is_leader() {
            return;
        }
        let commit = self.log.committed();
        for id in self.state.cluster().peer_ids() {
            let mut m = Message::new(MessageType::Heartbeat, self.id(), id, self.state.term());
            m.commit_index = commit;
            self.send(m);
        }
    }

    fn on_lease_tick(&mut self) {
        if !self.state.is_leader() {
            return;
        }
        if self.state.lease_check() {
            tracing::warn!(
                id = self.id(),
                term = self.state.term(),
                "lease lost for two consecutive checks, stepping down"
            );
            let term = self.state.term();
            self.step_down(term, None);
        }
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn campaign(&mut self) {
        self.state.become_candidate();
        self.hard_state_dirty = true;
        let (yes, _) = self.state.record_vote(self.id(), true);
        if yes >= self.state.quorum() {
            self.take_leadership();
            return;
        }

        let (last, last_term) = (self.log.last_index(), self.log.last_term());
        for id in self.state.cluster().peer_ids() {
            let mut m = Message::new(MessageType::Vote, self.id(), id, self.state.term());
            m.index = last;
            m.log_term = last_term;
            self.send(m);
        }
    }

    fn take_leadership(&mut self) {
        let last = self.log.last_index();
        let snapshot = self.log.snapshot_meta();
        let replayed = last == 0 || last == snapshot.index || self.log.applied() >= last;

        self.state.become_leader(last, replayed);
        self.hard_state_dirty = true;

        // Empty append under the new term; committing it commits every
        // prior term's entry beneath it.
        let term = self.state.term();
        let index = self.state.next_offset_mut().expect("leader offset").advance();
        let nop = Entry::nop(term, index);
        if let Err(e) = self.log.append(std::slice::from_ref(&nop)) {
            tracing::error!(error = %e, "failed to append leader nop");
        }

        self.broadcast_append();
        self.maybe_advance_commit();
    }

    // ------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------

    fn handle_message(&mut self, m: Message) {
        let mt = m.msg_type();

        if m.term > self.state.term() {
            match mt {
                // A pre-vote probe does not move terms.
                MessageType::Prevote | MessageType::PrevoteResponse => {}
                MessageType::AppendEntriesRequest
                | MessageType::Heartbeat
                | MessageType::SnapshotRequest => {
                    self.step_down(m.term, Some(m.from));
                }
                _ => self.step_down(m.term, None),
            }
        } else if m.term < self.state.term() {
            match mt {
                MessageType::Prevote
                | MessageType::Vote
                | MessageType::AppendEntriesRequest
                | MessageType::Heartbeat
                | MessageType::SnapshotRequest => {
                    let mut reply =
                        Message::new(response_kind(mt), self.id(), m.from, self.state.term());
                    reply.reject = true;
                    reply.reject_type = RejectType::LowTerm as i32;
                    self.send(reply);
                }
                _ => {
                    tracing::trace!(from = m.from, r#type = ?mt, "stale response dropped");
                }
            }
            return;
        }

        match mt {
            MessageType::Hup => self.on_election_timeout(),
            MessageType::Prevote => self.handle_prevote(m),
            MessageType::PrevoteResponse => self.handle_prevote_response(m),
            MessageType::Vote => self.handle_vote(m),
            MessageType::VoteResponse => self.handle_vote_response(m),
            MessageType::AppendEntriesRequest => self.handle_append_entries(m),
            MessageType::AppendEntriesResponse => self.handle_append_response(m),
            MessageType::SnapshotRequest => self.handle_snapshot_request(m),
            MessageType::SnapshotResponse => self.handle_snapshot_response(m),
            MessageType::Heartbeat => self.handle_heartbeat(m),
            MessageType::HeartbeatResponse => self.handle_heartbeat_response(m),
            MessageType::Propose | MessageType::Lease | MessageType::Nop => {
                tracing::trace!(r#type = ?mt, "local message kind on the wire, ignored");
            }
        }
    }

    fn handle_prevote(&mut self, m: Message) {
        let up_to_date = self.log.is_up_to_date(m.index, m.log_term);
        let grant = m.term > self.state.term() && up_to_date && !self.state.leader_in_lease();

        tracing::debug!(from = m.from, term = m.term, grant, "pre-vote request");
        let mut reply = Message::new(MessageType::PrevoteResponse, self.id(), m.from, m.term);
        reply.reject = !grant;
        self.send(reply);
    }

    fn handle_prevote_response(&mut self, m: Message) {
        if self.state.status() != Status::PreCandidate {
            return;
        }
        let (yes, no) = self.state.record_vote(m.from, !m.reject);
        let quorum = self.state.quorum();
        if yes >= quorum {
            self.campaign();
        } else if no >= quorum {
            let term = self.state.term();
            self.step_down(term, None);
        }
    }

    fn handle_vote(&mut self, m: Message) {
        // An established leader never grants a same-term vote, even with
        // its own ballot cleared.
        let free = !self.state.is_leader() && self.state.vote_for().map_or(true, |v| v == m.from);
        let grant = free && self.log.is_up_to_date(m.index, m.log_term);

        if grant {
            self.state.vote(m.from);
            self.hard_state_dirty = true;
            self.ticks.reset(TickKind::Election);
        }

        tracing::info!(from = m.from, term = m.term, grant, "vote request");
        let mut reply = Message::new(MessageType::VoteResponse, self.id(), m.from, self.state.term());
        reply.reject = !grant;
        self.send(reply);
    }

    fn handle_vote_response(&mut self, m: Message) {
        if self.state.status() != Status::Candidate || m.term != self.state.term() {
            return;
        }
        let (yes, no) = self.state.record_vote(m.from, !m.reject);
        let quorum = self.state.quorum();
        tracing::debug!(from = m.from, granted = !m.reject, yes, no, "vote response");
        if yes >= quorum {
            self.take_leadership();
        } else if no >= quorum {
            let term = self.state.term();
            self.step_down(term, None);
        }
    }

    fn note_leader_contact(&mut self, from: NodeId, term: u64) {
        if self.state.status() != Status::Follower || self.state.leader() != Some(from) {
            self.state.become_follower(term, Some(from));
        } else {
            self.ticks.reset(TickKind::Election);
        }
    }

    fn handle_append_entries(&mut self, m: Message) {
        self.note_leader_contact(m.from, m.term);

        let prev = m.index;
        let mut reply =
            Message::new(MessageType::AppendEntriesResponse, self.id(), m.from, self.state.term());

        if prev > self.log.last_index() {
            reply.reject = true;
            reply.reject_type = RejectType::LogNonSequential as i32;
            reply.reject_hint = self.log.last_index();
            tracing::debug!(prev, last = self.log.last_index(), "append beyond log end");
            self.send(reply);
            return;
        }

        if !self.log.match_term(prev, m.log_term) {
            reply.reject = true;
            reply.reject_type = RejectType::LogNotMatch as i32;
            reply.reject_hint = prev.saturating_sub(1).max(self.log.committed());
            tracing::debug!(prev, prev_term = m.log_term, "append prev mismatch");
            self.send(reply);
            return;
        }

        let last_new = prev + m.entries.len() as u64;

        if let Some(conflict) = self.log.find_conflict(&m.entries) {
            if conflict <= self.log.committed() {
                tracing::error!(conflict, committed = self.log.committed(), "conflict below committed index");
                reply.reject = true;
                reply.reject_type = RejectType::LogNotMatch as i32;
                reply.reject_hint = self.log.committed();
                self.send(reply);
                return;
            }

            if conflict <= self.log.last_index() {
                if let Err(e) = self.log.truncate_suffix(conflict) {
                    tracing::error!(conflict, error = %e, "suffix truncation failed");
                    return;
                }
                self.epoch += 1;
                self.shipped_persist = self.shipped_persist.min(conflict - 1);
                self.acked_persist = self.acked_persist.min(conflict - 1);
            }

            let offset = (conflict - (prev + 1)) as usize;
            if let Err(e) = self.log.append(&m.entries[offset..]) {
                tracing::error!(error = %e, "append entries failed");
                return;
            }
        }

        if self.log.maybe_commit(m.commit_index.min(last_new)) {
            self.state.cluster().local().set_committed(self.log.committed());
        }

        reply.index = last_new;
        self.send(reply);
    }

    fn handle_append_response(&mut self, m: Message) {
        if !self.state.is_leader() {
            return;
        }
        let Some(peer) = self.state.cluster().get(m.from).cloned() else {
            return;
        };

        if m.reject {
            match m.reject_type() {
                RejectType::LogNotMatch | RejectType::LogNonSequential => {
                    let next = (m.reject_hint + 1).max(1);
                    peer.set_next_index(next);
                    tracing::debug!(peer = m.from, next, "replication rejected, backing off");
                    if next <= self.log.first_index() && self.log.snapshot_meta().index > 0 {
                        self.send_snapshot(m.from);
                    } else {
                        self.send_append(m.from);
                    }
                }
                RejectType::LowTerm | RejectType::None => {}
            }
            return;
        }

        if m.index > peer.match_index() {
            peer.set_match_index(m.index);
        }
        peer.set_next_index(m.index + 1);
        if peer.pending_snapshot() != 0 && m.index >= peer.pending_snapshot() {
            peer.set_pending_snapshot(0);
        }

        self.maybe_advance_commit();

        if peer.next_index() <= self.log.last_index() {
            self.send_append(m.from);
        }
    }

    fn handle_heartbeat(&mut self, m: Message) {
        self.note_leader_contact(m.from, m.term);

        if self.log.maybe_commit(m.commit_index.min(self.log.last_index())) {
            self.state.cluster().local().set_committed(self.log.committed());
        }

        let mut reply =
            Message::new(MessageType::HeartbeatResponse, self.id(), m.from, self.state.term());
        reply.index = self.log.last_index();
        self.send(reply);
    }

    fn handle_heartbeat_response(&mut self, m: Message) {
        if !self.state.is_leader() {
            return;
        }
        self.state.record_lease(m.from);

        // A follower reporting progress past an in-flight snapshot has
        // installed it, even if the acknowledgement was lost.
        if let Some(peer) = self.state.cluster().get(m.from) {
            if peer.pending_snapshot() != 0 && m.index >= peer.pending_snapshot() {
                peer.set_pending_snapshot(0);
            }
        }

        // Repair lag discovered through the heartbeat exchange.
        let lagging = self
            .state
            .cluster()
            .get(m.from)
            .map(|p| p.pending_snapshot() == 0 && m.index < self.log.last_index())
            .unwrap_or(false);
        if lagging {
            self.send_append(m.from);
        }
    }

    fn handle_snapshot_request(&mut self, m: Message) {
        self.note_leader_contact(m.from, m.term);

        let Some(snapshot) = m.snapshot else {
            tracing::warn!(from = m.from, "snapshot request without snapshot body");
            return;
        };
        let meta = snapshot.metadata();

        let mut reply =
            Message::new(MessageType::SnapshotResponse, self.id(), m.from, self.state.term());
        reply.index = meta.index;

        if meta.index <= self.log.applied() {
            tracing::info!(index = meta.index, applied = self.log.applied(), "stale snapshot ignored");
            self.send(reply);
            return;
        }

        tracing::info!(index = meta.index, term = meta.term, "snapshot accepted for install");
        self.log.apply_snapshot_meta(meta);
        self.epoch += 1;
        self.state.cluster().local().set_committed(self.log.committed());
        self.shipped_persist = self.shipped_persist.max(meta.index);
        self.acked_persist = self.acked_persist.max(meta.index);
        self.shipped_apply = self.shipped_apply.max(meta.index);
        self.acked_apply = self.acked_apply.max(meta.index);
        self.pending_snapshot = Some(snapshot);
        self.send(reply);
    }

    fn handle_snapshot_response(&mut self, m: Message) {
        if !self.state.is_leader() {
            return;
        }
        let Some(peer) = self.state.cluster().get(m.from).cloned() else {
            return;
        };
        peer.set_pending_snapshot(0);
        peer.set_next_index(m.index + 1);
        // The snapshot boundary is replicated state by definition.
        if m.index > peer.match_index() {
            peer.set_match_index(m.index);
        }
        self.send_append(m.from);
    }

    fn on_peer_state(&mut self, id: NodeId, connected: bool) {
        if let Some(peer) = self.state.cluster().get(id) {
            peer.set_disconnected(!connected);
            tracing::info!(peer = id, connected, "peer connectivity changed");
        }
        self.state.refresh_group_state(false);
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    fn broadcast_append(&mut self) {
        for id in self.state.cluster().peer_ids() {
            self.send_append(id);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let Some(peer) = self.state.cluster().get(to).cloned() else {
            return;
        };
        if peer.pending_snapshot() != 0 {
            return;
        }

        let next = peer.next_index().max(1);
        if next < self.log.first_index() {
            self.send_snapshot(to);
            return;
        }

        let prev = next - 1;
        let prev_term = if prev == 0 {
            0
        } else {
            match self.log.term(prev) {
                Ok(t) => t,
                Err(_) => {
                    self.send_snapshot(to);
                    return;
                }
            }
        };

        let last = self.log.last_index();
        let hi = last.min(next + self.config.max_transport_entries - 1);
        let entries = if next <= hi {
            match self.log.entries(next, hi + 1) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(to, next, error = %e, "read for replication failed");
                    return;
                }
            }
        } else {
            Vec::new()
        };

        let mut m =
            Message::new(MessageType::AppendEntriesRequest, self.id(), to, self.state.term());
        m.index = prev;
        m.log_term = prev_term;
        m.entries = entries;
        m.commit_index = self.log.committed();
        self.send(m);
    }

    fn send_snapshot(&mut self, to: NodeId) {
        let Some(meta) = self.snapshotter.latest() else {
            tracing::warn!(to, "peer needs a snapshot but none exists yet");
            return;
        };
        let snapshot = match self.snapshotter.load(meta.index) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(index = meta.index, error = %e, "snapshot load failed");
                return;
            }
        };

        if let Some(peer) = self.state.cluster().get(to) {
            peer.set_pending_snapshot(meta.index);
        }

        tracing::info!(to, index = meta.index, term = meta.term, "sending snapshot to lagging peer");
        let mut m = Message::new(MessageType::SnapshotRequest, self.id(), to, self.state.term());
        m.snapshot = Some(snapshot);
        self.send(m);
    }

    /// Quorum commit rule: the index matched by a majority commits, but
    /// only once an entry of the current term is part of that majority.
    fn maybe_advance_commit(&mut self) {
        if !self.state.is_leader() {
            return;
        }

        let mut matches: Vec<u64> =
            self.state.cluster().peers().map(|p| p.match_index()).collect();
        matches.push(self.log.last_index());
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matches[self.state.quorum() - 1];
        if candidate <= self.log.committed() {
            return;
        }

        match self.log.term(candidate) {
            Ok(t) if t == self.state.term() => {
                self.log.maybe_commit(candidate);
                let committed = self.log.committed();
                self.state.cluster().local().set_committed(committed);
                tracing::debug!(committed, "commit index advanced");

                // Share the new commit index with caught-up peers without
                // waiting for the next heartbeat window.
                let caught_up: Vec<NodeId> = self
                    .state
                    .cluster()
                    .peers()
                    .filter(|p| p.match_index() >= committed)
                    .map(|p| p.id)
                    .collect();
                for id in caught_up {
                    self.send_append(id);
                }
            }
            Ok(_) => {
                tracing::debug!(candidate, "quorum match held back by the commit-across-terms rule");
            }
            Err(e) => {
                tracing::error!(candidate, error = %e, "term lookup for commit failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Ready
    // ------------------------------------------------------------------

    /// Drain this cycle's effects into one batch.
    pub fn poll_ready(&mut self) -> Option<Ready> {
        let hard_state = if self.hard_state_dirty {
            Some(HardState {
                term: self.state.term(),
                vote: self.state.vote_for().unwrap_or(0),
            })
        } else {
            None
        };

        let last = self.log.last_index();
        let persist_lo = (self.shipped_persist + 1).max(self.log.first_index());
        let entries = if last >= persist_lo {
            self.log.entries(persist_lo, last + 1).unwrap_or_else(|e| {
                tracing::error!(error = %e, "reading entries to persist failed");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let committed = self.log.committed();
        let apply_lo = (self.shipped_apply + 1).max(self.log.first_index());
        let committed_entries = if committed >= apply_lo {
            self.log.entries(apply_lo, committed + 1).unwrap_or_else(|e| {
                tracing::error!(error = %e, "reading entries to apply failed");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let mut responders = BTreeMap::new();
        if let Some(hi) = committed_entries.last().map(|e| e.index) {
            let keep = self.pending_responders.split_off(&(hi + 1));
            responders = std::mem::replace(&mut self.pending_responders, keep);
        }

        let ready = Ready {
            hard_state,
            entries,
            messages: std::mem::take(&mut self.msgs),
            committed_entries,
            responders,
            snapshot: self.pending_snapshot.take(),
            epoch: self.epoch,
        };

        if ready.is_empty() {
            return None;
        }

        if let Some(hi) = ready.persist_hi() {
            self.shipped_persist = hi;
        }
        if let Some(hi) = ready.apply_hi() {
            self.shipped_apply = hi;
        }
        if let Some(snapshot) = &ready.snapshot {
            let index = snapshot.metadata().index;
            self.shipped_apply = self.shipped_apply.max(index);
        }
        self.hard_state_dirty = false;

        Some(ready)
    }
}

impl Engine {
    /// Fail every pending proposal; called once on shutdown.
    pub fn fail_pending(&mut self) {
        for (_, responder) in std::mem::take(&mut self.pending_responders) {
            let _ = responder.send(Err(ProposeError::Unavailable));
        }
    }
}

fn response_kind(request: MessageType) -> MessageType {
    match request {
        MessageType::Prevote => MessageType::PrevoteResponse,
        MessageType::Vote => MessageType::VoteResponse,
        MessageType::AppendEntriesRequest => MessageType::AppendEntriesResponse,
        MessageType::Heartbeat => MessageType::HeartbeatResponse,
        MessageType::SnapshotRequest => MessageType::SnapshotResponse,
        other => other,
    }
}
