//! The raft event loop.
//!
//! Single-threaded consumer of TICK, MESSAGE, PROPOSAL and ADVANCE.
//! Ticks are drained eagerly at the top of every cycle (they are
//! time-sensitive), then inbound messages, then local proposals, then
//! group-commit acknowledgements. Each cycle ends by draining the engine
//! into a READY batch and publishing fresh metrics. Engine-level failures
//! are logged and the cycle continues; only shutdown ends the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::RequestChannel;
use crate::engine::Engine;
use crate::metrics::RaftMetrics;

pub struct RaftLoop {
    engine: Engine,
    channel: Arc<RequestChannel>,
    metrics_tx: watch::Sender<RaftMetrics>,
    idle_timeout: Duration,
}

impl RaftLoop {
    pub fn spawn(
        engine: Engine,
        channel: Arc<RequestChannel>,
        metrics_tx: watch::Sender<RaftMetrics>,
    ) -> JoinHandle<()> {
        let raft_loop = RaftLoop {
            engine,
            channel,
            metrics_tx,
            idle_timeout: Duration::from_millis(500),
        };
        tokio::spawn(raft_loop.run())
    }

    async fn run(mut self) {
        tracing::info!(id = self.engine.state.id(), "raft loop started");

        // All peers start connected; derive the initial group state and
        // tell listeners about it.
        self.engine.state.refresh_group_state(true);
        self.publish_metrics();

        loop {
            if self.channel.is_closed() {
                break;
            }

            self.wait_for_input().await;

            self.channel.tick.set_can_fetch(false);
            for kind in self.channel.tick.drain() {
                self.engine.handle_tick(kind);
            }

            self.channel.message.set_can_fetch(false);
            for inbound in self.channel.message.drain() {
                self.engine.handle_inbound(inbound);
            }

            self.channel.proposal.set_can_fetch(false);
            for proposal in self.channel.proposal.drain() {
                self.engine.handle_proposal(proposal);
            }

            self.channel.advance.set_can_fetch(false);
            for advance in self.channel.advance.drain() {
                self.engine.handle_advance(advance);
            }

            if let Some(ready) = self.engine.poll_ready() {
                self.channel.ready.offer(ready);
            }

            self.publish_metrics();
        }

        self.engine.fail_pending();
        for proposal in self.channel.proposal.drain() {
            let _ = proposal
                .responder
                .send(Err(crate::error::ProposeError::Unavailable));
        }
        tracing::info!(id = self.engine.state.id(), "raft loop stopped");
    }

    /// Block until any of the four input kinds signals work, with the
    /// bounded timeout that keeps the loop live across lost wakeups.
    async fn wait_for_input(&self) {
        let timeout = self.idle_timeout;
        tokio::select! {
            _ = self.channel.tick.ensure(timeout) => {}
            _ = self.channel.message.ensure(timeout) => {}
            _ = self.channel.proposal.ensure(timeout) => {}
            _ = self.channel.advance.ensure(timeout) => {}
        }
    }

    fn publish_metrics(&self) {
        let engine = &self.engine;
        let marks = engine.log.marks();
        let next = RaftMetrics {
            id: engine.state.id(),
            term: engine.state.term(),
            status: engine.state.status(),
            leader: engine.state.leader(),
            group_state: engine.state.group_state(),
            replay_state: engine.state.cluster().local().replay_state(),
            first_index: marks.first(),
            applied_index: marks.applied(),
            committed_index: marks.committed(),
            last_index: marks.last(),
            snapshot_index: engine.log.snapshot_meta().index,
        };

        self.metrics_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
