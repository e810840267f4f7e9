//! Observable node state, published over a watch channel after every
//! raft-loop cycle.

use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;

use crate::node::{GroupState, ReplayState};
use crate::state::Status;
use crate::NodeId;

/// A point-in-time snapshot of the node, cheap to clone.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub term: u64,
    pub status: Status,
    pub leader: Option<NodeId>,
    pub group_state: GroupState,
    pub replay_state: ReplayState,
    pub first_index: u64,
    pub applied_index: u64,
    pub committed_index: u64,
    pub last_index: u64,
    pub snapshot_index: u64,
}

impl RaftMetrics {
    pub fn initial(id: NodeId) -> Self {
        RaftMetrics {
            id,
            term: 0,
            status: Status::Follower,
            leader: None,
            group_state: GroupState::Unavailable,
            replay_state: ReplayState::Replaying,
            first_index: 1,
            applied_index: 0,
            committed_index: 0,
            last_index: 0,
            snapshot_index: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("timeout after {timeout:?} waiting for {waiting_for}: latest {latest:?}")]
pub struct WaitError {
    pub timeout: Duration,
    pub waiting_for: String,
    pub latest: RaftMetrics,
}

/// Await a metrics condition with a deadline.
pub struct Wait {
    pub(crate) timeout: Duration,
    pub(crate) rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Resolve once `pred` holds, or fail at the deadline.
    pub async fn metrics<F>(&mut self, pred: F, waiting_for: &str) -> Result<RaftMetrics, WaitError>
    where
        F: Fn(&RaftMetrics) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let current = self.rx.borrow();
                if pred(&current) {
                    return Ok(current.clone());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WaitError {
                    timeout: self.timeout,
                    waiting_for: waiting_for.to_string(),
                    latest: self.rx.borrow().clone(),
                });
            }
            match tokio::time::timeout(remaining, self.rx.changed()).await {
                Ok(Ok(())) => {}
                // Publisher gone: re-check on a slow poll until the
                // deadline instead of spinning.
                Ok(Err(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(_) => {}
            }
        }
    }
}
