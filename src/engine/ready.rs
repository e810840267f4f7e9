//! The batch handed from the raft loop to the group-commit loop.

use std::collections::BTreeMap;

use crate::channel::Responder;
use crate::message::{HardState, Message, Snapshot};
use crate::Entry;

/// Everything one raft-loop cycle produced.
///
/// The group-commit loop honors a strict order per batch: hard state and
/// entries become durable first, then committed entries are enqueued for
/// apply, then messages are dispatched, and finally an advance
/// acknowledgement goes back to the raft loop.
pub struct Ready {
    /// Changed election state to persist before anything is sent.
    pub hard_state: Option<HardState>,
    /// New log entries to group-commit. The first may overwrite a
    /// conflicting stable suffix; the WAL truncates before appending.
    pub entries: Vec<Entry>,
    /// Outgoing messages, dispatched only after the batch is durable.
    pub messages: Vec<Message>,
    /// Committed-and-stable entries for the apply loop.
    pub committed_entries: Vec<Entry>,
    /// Proposal responders keyed by index, resolved after apply.
    pub responders: BTreeMap<u64, Responder>,
    /// Snapshot accepted for installation.
    pub snapshot: Option<Snapshot>,
    /// Log-truncation epoch this batch was built under. The advance for
    /// a batch from an older epoch must not move the stable watermark:
    /// the indices it persisted have been overwritten since.
    pub epoch: u64,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none()
            && self.entries.is_empty()
            && self.messages.is_empty()
            && self.committed_entries.is_empty()
            && self.snapshot.is_none()
    }

    /// Highest index this batch persists, if any.
    pub fn persist_hi(&self) -> Option<u64> {
        self.entries.last().map(|e| e.index)
    }

    /// Highest index this batch schedules for apply, if any.
    pub fn apply_hi(&self) -> Option<u64> {
        self.committed_entries.last().map(|e| e.index)
    }
}
