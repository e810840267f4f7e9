//! The public handle to a raftling node.
//!
//! [`Raft`] is cheap to clone and safe to share; it talks to the engine
//! loops exclusively through the request channel.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{Apply, Inbound, Proposal, RequestChannel};
use crate::config::Config;
use crate::core::{ApplyLoop, Clock, CommitLoop, RaftLoop, TickControl};
use crate::engine::Engine;
use crate::error::{Fatal, ProposeError};
use crate::log::{RaftLog, Watermarks};
use crate::message::Message;
use crate::metrics::{RaftMetrics, Wait};
use crate::node::{Cluster, GroupState};
use crate::snapshot::Snapshotter;
use crate::state::{Listeners, NodeState, Status};
use crate::state_machine::StateMachine;
use crate::storage;
use crate::network::Transporter;
use crate::wal::Wal;
use crate::NodeId;

struct RaftInner {
    config: Arc<Config>,
    channel: Arc<RequestChannel>,
    metrics_rx: watch::Receiver<RaftMetrics>,
    marks: Arc<Watermarks>,
    cluster: Arc<Cluster>,
    listeners: Arc<Listeners>,
    transporter: Arc<dyn Transporter>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A running raft node.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

impl Raft {
    /// Validate the configuration, recover durable state, and start the
    /// clock and the three engine loops.
    pub async fn spawn(
        config: Config,
        state_machine: Arc<dyn StateMachine>,
        transporter: Arc<dyn Transporter>,
    ) -> Result<Raft, Fatal> {
        let config = Arc::new(config.validate()?);
        let cluster = Arc::new(Cluster::from_config(&config)?);

        let wal = Arc::new(Wal::open(config.wal_dir(), config.wal_segment_bytes)?);
        let snapshotter = Arc::new(Snapshotter::open(
            config.snapshot_dir(),
            config.snapshot_read_only,
            config.min_snapshots_retention,
        )?);
        let store = storage::open(config.storage_type, config.ring_buffer_size, wal.clone());

        // Recover: snapshot boundary first, then the WAL suffix past it.
        // A log that ends below the snapshot was superseded wholesale
        // (crash between snapshot install and WAL reset).
        let snapshot_meta = snapshotter.latest().unwrap_or_default();
        let mut wal_last = wal.last_index();
        if wal_last > 0 && wal_last < snapshot_meta.index {
            wal.truncate_suffix(0)?;
            wal_last = 0;
        }
        let wal_first = wal.first_index();
        if wal_last > 0 {
            let lo = (snapshot_meta.index + 1).max(wal_first);
            if lo <= wal_last {
                let entries = wal.entries(lo, wal_last + 1)?;
                store.append(&entries)?;
            }
        }

        let marks = Arc::new(Watermarks::default());
        let mut log = RaftLog::new(store.clone(), marks.clone());
        log.recover(snapshot_meta, wal_last);

        let listeners = Arc::new(Listeners::default());
        let ticks = Arc::new(TickControl::new(config.clone()));
        let mut state = NodeState::new(config.clone(), cluster.clone(), ticks.clone(), listeners.clone());

        // Restore the election term from snapshot, last entry and hard
        // state; a persisted vote only counts in its own term.
        let mut term = snapshot_meta.term;
        if let Some(last) = wal.last_entry() {
            term = term.max(last.term);
        }
        let hard_state = wal.load_hard_state()?;
        if let Some(hs) = &hard_state {
            term = term.max(hs.term);
        }
        state.set_term(term);
        if let Some(hs) = hard_state {
            if hs.vote != 0 && hs.term == term {
                state.vote(hs.vote);
            }
        }
        tracing::info!(
            id = config.id,
            term,
            snapshot = snapshot_meta.index,
            wal_last,
            "node state recovered"
        );

        // The leader replay barrier: capture `last_index` at the moment
        // of the transition.
        let low_water_mark = Arc::new(AtomicU64::new(0));
        {
            let marks = marks.clone();
            let low_water_mark = low_water_mark.clone();
            listeners.add_election(Box::new(move |status| {
                if status == Status::Leader {
                    low_water_mark.store(marks.last(), Ordering::Release);
                }
            }));
        }

        let channel = Arc::new(RequestChannel::new());
        let (metrics_tx, metrics_rx) = watch::channel(RaftMetrics::initial(config.id));

        // Replay the persisted snapshot into the fresh state machine
        // before anything else reaches the apply loop.
        if snapshot_meta.index > 0 {
            let snapshot = snapshotter.load(snapshot_meta.index)?;
            channel.apply.offer(Apply {
                committed_entries: Vec::new(),
                snapshot: Some(snapshot),
                responders: BTreeMap::new(),
            });
        }

        let engine = Engine::new(
            config.clone(),
            state,
            log,
            snapshotter.clone(),
            ticks.clone(),
        );

        let mut handles = Vec::with_capacity(4);
        handles.push(Clock::spawn(ticks, channel.clone()));
        handles.push(RaftLoop::spawn(engine, channel.clone(), metrics_tx));
        handles.push(CommitLoop::spawn(
            channel.clone(),
            wal,
            store,
            transporter.clone(),
            cluster.clone(),
            marks.clone(),
        ));
        handles.push(ApplyLoop::spawn(
            config.clone(),
            channel.clone(),
            state_machine,
            snapshotter,
            marks.clone(),
            cluster.clone(),
            metrics_rx.clone(),
            low_water_mark,
            term,
        ));

        Ok(Raft {
            inner: Arc::new(RaftInner {
                config,
                channel,
                metrics_rx,
                marks,
                cluster,
                listeners,
                transporter,
                handles: Mutex::new(handles),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.config.id
    }

    /// Replicate `data` through the cluster. Resolves with the entry's
    /// log index once the entry has been committed and applied; fails
    /// with a redirect when this node is not the leader.
    pub async fn propose(&self, data: impl Into<Bytes>) -> Result<u64, ProposeError> {
        self.propose_with(data, BTreeMap::new()).await
    }

    /// [`Raft::propose`] with entry attachments.
    pub async fn propose_with(
        &self,
        data: impl Into<Bytes>,
        attachments: BTreeMap<String, String>,
    ) -> Result<u64, ProposeError> {
        if self.inner.channel.is_closed() {
            return Err(ProposeError::Unavailable);
        }

        let (tx, rx) = oneshot::channel();
        self.inner.channel.proposal.offer(Proposal {
            data: data.into(),
            attachments,
            responder: tx,
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ProposeError::Unavailable),
        }
    }

    /// Inbound edge for the embedding transport.
    pub fn handle_message(&self, message: Message) {
        self.inner.channel.message.offer(Inbound::Message(message));
    }

    /// Connectivity change reported by the embedding transport.
    pub fn peer_state(&self, id: NodeId, connected: bool) {
        self.inner
            .channel
            .message
            .offer(Inbound::PeerState { id, connected });
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.metrics_rx.clone()
    }

    /// Await a metrics condition, e.g.
    /// `raft.wait(timeout).metrics(|m| m.status == Status::Leader, "leader").await`.
    pub fn wait(&self, timeout: Duration) -> Wait {
        Wait {
            timeout,
            rx: self.inner.metrics_rx.clone(),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.inner.metrics_rx.borrow().term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.inner.metrics_rx.borrow().leader
    }

    pub fn status(&self) -> Status {
        self.inner.metrics_rx.borrow().status
    }

    pub fn is_leader(&self) -> bool {
        self.status() == Status::Leader
    }

    pub fn group_state(&self) -> GroupState {
        self.inner.metrics_rx.borrow().group_state
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.marks.applied()
    }

    /// Whether the entry at `index` has been delivered to the state
    /// machine. `index` must lie above the log's first index; entries at
    /// or below it are only reachable through a snapshot.
    pub fn applied(&self, index: u64) -> bool {
        assert!(
            index > self.inner.marks.first(),
            "index {index} not above first index {}",
            self.inner.marks.first()
        );
        self.inner.marks.applied() >= index
    }

    pub fn committed_index(&self) -> u64 {
        self.inner.marks.committed()
    }

    pub fn last_index(&self) -> u64 {
        self.inner.marks.last()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.inner.cluster
    }

    pub fn add_election_listener(&self, listener: impl Fn(Status) + Send + Sync + 'static) {
        self.inner.listeners.add_election(Box::new(listener));
    }

    pub fn add_group_state_listener(
        &self,
        listener: impl Fn(GroupState, GroupState) + Send + Sync + 'static,
    ) {
        self.inner.listeners.add_group_state(Box::new(listener));
    }

    /// Stop every loop, close the transporter and wait for the workers.
    /// In-flight apply batches complete; pending proposals fail with
    /// `Unavailable`.
    pub async fn shutdown(&self) {
        tracing::info!(id = self.id(), "shutting down");
        self.inner.channel.close();
        self.inner.transporter.close();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
