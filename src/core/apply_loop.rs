//! The apply loop.
//!
//! Single-threaded consumer of APPLY. Hands committed entries to the
//! user state machine (failures are logged, never retried by the
//! engine), advances the applied index, evaluates the replay barrier
//! after leadership changes, installs snapshots, and triggers background
//! snapshot builds when the applied delta crosses the configured
//! threshold. The bounded wait on an empty slot doubles as the snapshot
//! trigger check interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::channel::{Apply, Inbound, RequestChannel};
use crate::config::Config;
use crate::log::Watermarks;
use crate::message::Snapshot;
use crate::metrics::RaftMetrics;
use crate::node::{Cluster, ReplayState};
use crate::snapshot::Snapshotter;
use crate::state::Status;
use crate::state_machine::StateMachine;

pub struct ApplyLoop {
    config: Arc<Config>,
    channel: Arc<RequestChannel>,
    state_machine: Arc<dyn StateMachine>,
    snapshotter: Arc<Snapshotter>,
    marks: Arc<Watermarks>,
    cluster: Arc<Cluster>,
    metrics_rx: watch::Receiver<RaftMetrics>,
    /// Last index at the moment this node took leadership; the replay
    /// barrier for leaders.
    low_water_mark: Arc<AtomicU64>,
    /// Bounds concurrent background snapshot builds.
    build_permits: Arc<Semaphore>,
    /// Term of the newest applied entry, stamped into built snapshots.
    last_applied_term: u64,
}

impl ApplyLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: Arc<Config>,
        channel: Arc<RequestChannel>,
        state_machine: Arc<dyn StateMachine>,
        snapshotter: Arc<Snapshotter>,
        marks: Arc<Watermarks>,
        cluster: Arc<Cluster>,
        metrics_rx: watch::Receiver<RaftMetrics>,
        low_water_mark: Arc<AtomicU64>,
        last_applied_term: u64,
    ) -> JoinHandle<()> {
        let permits = config.background_threads_num.max(1);
        let apply_loop = ApplyLoop {
            config,
            channel,
            state_machine,
            snapshotter,
            marks,
            cluster,
            metrics_rx,
            low_water_mark,
            build_permits: Arc::new(Semaphore::new(permits)),
            last_applied_term,
        };
        tokio::spawn(apply_loop.run())
    }

    async fn run(mut self) {
        tracing::info!("apply loop started");
        let check_interval = Duration::from_secs(self.config.snapshot_trigger_check_interval_seconds);

        loop {
            if self.channel.is_closed() && self.channel.apply.is_empty() {
                break;
            }

            if !self.channel.apply.can_fetch() {
                self.channel.apply.ensure(check_interval).await;
            }
            self.channel.apply.set_can_fetch(false);

            // One batch per wake, then re-check the gate.
            if let Some(apply) = self.channel.apply.try_poll() {
                self.handle(apply).await;
            }

            self.trigger_snapshot();
        }

        tracing::info!("apply loop stopped");
    }

    async fn handle(&mut self, apply: Apply) {
        if !apply.committed_entries.is_empty() {
            // The user state machine owns the full processing of the
            // batch; a failure here is not retried by the engine.
            if let Err(e) = self.state_machine.apply(&apply.committed_entries).await {
                tracing::error!(
                    error = %e,
                    "state machine apply failed; the engine will not retry this batch"
                );
            }

            let last = apply.committed_entries.last().expect("non-empty batch");
            self.marks.applied_to(last.index);
            self.last_applied_term = last.term;
            let local = self.cluster.local();
            local.set_applying(false);
            tracing::debug!(id = local.id, applied = last.index, "applied index advanced");

            for (index, responder) in apply.responders {
                let _ = responder.send(Ok(index));
            }

            // Data-consistency barrier after a leadership change.
            if local.replay_state() == ReplayState::Replaying {
                let is_leader = self.metrics_rx.borrow().status == Status::Leader;
                let caught_up = if is_leader {
                    last.index >= self.low_water_mark.load(Ordering::Acquire)
                } else {
                    last.index >= local.committed()
                };
                if caught_up {
                    local.set_replay_state(ReplayState::Replayed);
                    tracing::info!(
                        id = local.id,
                        applied = last.index,
                        leader = is_leader,
                        "state machine replay complete"
                    );
                }
            }
        }

        if let Some(snapshot) = apply.snapshot {
            self.install_snapshot(snapshot).await;
        }
    }

    async fn install_snapshot(&mut self, snapshot: Snapshot) {
        let meta = snapshot.metadata();
        tracing::info!(index = meta.index, term = meta.term, "installing snapshot");

        if let Err(e) = self.snapshotter.save(&snapshot) {
            tracing::error!(index = meta.index, error = %e, "snapshot save failed");
        }

        self.marks.applied_to(meta.index);
        self.last_applied_term = meta.term;
        self.cluster.local().set_applying(false);

        let body = self.snapshotter.body(&snapshot);
        match self.state_machine.apply_snapshot(body).await {
            Ok(()) => {
                tracing::info!(index = meta.index, "snapshot applied to state machine");
            }
            Err(e) => {
                tracing::error!(index = meta.index, error = %e, "state machine snapshot apply failed");
            }
        }
    }

    /// Kick off a background snapshot build when the applied delta since
    /// the newest snapshot crosses the threshold.
    fn trigger_snapshot(&self) {
        let applied = self.marks.applied();
        let base = self.snapshotter.latest().map(|m| m.index).unwrap_or(0);
        if applied < base || applied - base < self.config.snapshot_trigger_threshold {
            return;
        }

        let Ok(permit) = self.build_permits.clone().try_acquire_owned() else {
            tracing::debug!("snapshot build already saturated");
            return;
        };

        let term = self.last_applied_term;
        let state_machine = self.state_machine.clone();
        let snapshotter = self.snapshotter.clone();
        let channel = self.channel.clone();

        tracing::info!(applied, base, "snapshot build triggered");
        tokio::spawn(async move {
            let _permit = permit;
            let data = match state_machine.snapshot().await {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(error = %e, "state machine snapshot build failed");
                    return;
                }
            };

            let snapshot = Snapshot::new(applied, term, data);
            match snapshotter.save(&snapshot) {
                Ok(()) => {
                    // The raft loop compacts the log past the boundary.
                    channel.message.offer(Inbound::SnapshotBuilt { index: applied });
                }
                Err(e) => {
                    tracing::error!(index = applied, error = %e, "snapshot save failed, will retry on next trigger");
                }
            }
        });
    }
}
