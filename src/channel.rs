//! Typed request channel between the engine loops.
//!
//! One slot per [`EventType`](crate::message::EventType): TICK, READY,
//! MESSAGE, PROPOSAL, ADVANCE, APPLY. Each slot pairs a FIFO queue with a
//! "work pending" flag and a notifier. Consumers that observe the flag
//! unset re-check after registering for wakeup and then wait with a
//! bounded timeout, so a lost signal can only ever cost one timeout
//! interval, never liveness.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::Notify;

use crate::engine::Ready;
use crate::error::ProposeError;
use crate::message::{Message, Snapshot};
use crate::Entry;
use crate::NodeId;

/// Which logical timer fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickKind {
    Election,
    Heartbeat,
    Lease,
}

/// Inbound edge of the raft loop: peer messages, connectivity changes
/// and local completion events.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    PeerState { id: NodeId, connected: bool },
    /// A background snapshot build finished; the log can compact.
    SnapshotBuilt { index: u64 },
}

/// Completion side of a proposal future.
pub type Responder = oneshot::Sender<Result<u64, ProposeError>>;

/// A local proposal awaiting leader acceptance.
#[derive(Debug)]
pub struct Proposal {
    pub data: Bytes,
    pub attachments: BTreeMap<String, String>,
    pub responder: Responder,
}

/// Acknowledgement from the group-commit loop back to the raft loop.
pub struct Advance {
    /// Highest index made durable so far; the engine retries past this
    /// watermark when a batch was rejected.
    pub stable_index: u64,
    /// Highest index the batch handed to the apply loop (0 when none).
    pub applied_enqueued: u64,
    /// False when the WAL rejected the batch.
    pub accepted: bool,
    /// Responders of a rejected batch, returned to the raft loop so the
    /// retried entries keep their futures.
    pub responders: BTreeMap<u64, Responder>,
    /// Echo of the batch's truncation epoch.
    pub epoch: u64,
}

/// Work for the apply loop: committed-and-stable entries and/or a
/// snapshot to install.
pub struct Apply {
    pub committed_entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    /// Proposal responders keyed by log index, resolved after apply.
    pub responders: BTreeMap<u64, Responder>,
}

/// One slot of the request channel.
pub struct TypedSlot<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    can_fetch: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl<T> TypedSlot<T> {
    fn new(closed: Arc<AtomicBool>) -> Self {
        TypedSlot {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            can_fetch: AtomicBool::new(false),
            closed,
        }
    }

    /// Enqueue and wake the consumer.
    pub fn offer(&self, item: T) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(item);
        }
        self.can_fetch.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Remove-and-return the head, if any.
    pub fn try_poll(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Take everything currently queued, preserving order.
    pub fn drain(&self) -> Vec<T> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    pub fn can_fetch(&self) -> bool {
        self.can_fetch.load(Ordering::Acquire)
    }

    pub fn set_can_fetch(&self, can: bool) {
        self.can_fetch.store(can, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Wait until work is flagged, the slot is closed, or `timeout`
    /// elapses. Interest is registered before the re-check so a signal
    /// between check and wait cannot be lost.
    pub async fn ensure(&self, timeout: Duration) {
        if self.can_fetch() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let notified = self.notify.notified();
        tokio::pin!(notified);

        if self.can_fetch() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let _ = tokio::time::timeout(timeout, notified).await;
    }

    /// Bounded-blocking poll: one `ensure` pass, then one fetch attempt.
    pub async fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.try_poll() {
            return Some(item);
        }
        self.ensure(timeout).await;
        self.try_poll()
    }

    fn wake(&self) {
        self.notify.notify_one();
    }
}

/// The typed mailbox shared by the three loops and the clock.
pub struct RequestChannel {
    closed: Arc<AtomicBool>,
    pub tick: TypedSlot<TickKind>,
    pub message: TypedSlot<Inbound>,
    pub proposal: TypedSlot<Proposal>,
    pub ready: TypedSlot<Ready>,
    pub advance: TypedSlot<Advance>,
    pub apply: TypedSlot<Apply>,
}

impl RequestChannel {
    pub fn new() -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        RequestChannel {
            tick: TypedSlot::new(closed.clone()),
            message: TypedSlot::new(closed.clone()),
            proposal: TypedSlot::new(closed.clone()),
            ready: TypedSlot::new(closed.clone()),
            advance: TypedSlot::new(closed.clone()),
            apply: TypedSlot::new(closed.clone()),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the channel closed and wake every consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tick.wake();
        self.message.wake();
        self.proposal.wake();
        self.ready.wake();
        self.advance.wake();
        self.apply.wake();
    }
}

impl Default for RequestChannel {
    fn default() -> Self {
        Self::new()
    }
}
