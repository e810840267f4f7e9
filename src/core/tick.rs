//! Logical clock: a tick task driving the election, heartbeat and lease
//! timers.
//!
//! The clock owns no raft state. Each registered timer counts ticks on
//! the clock task and, when its window elapses, posts a [`TickKind`] into
//! the request channel and returns promptly. Role transitions register
//! and deregister timers through [`TickControl`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::channel::{RequestChannel, TickKind};
use crate::config::Config;

struct Timer {
    kind: TickKind,
    active: AtomicBool,
    elapsed: AtomicU64,
    /// Ticks until fire; re-randomized on every election reset.
    timeout: AtomicU64,
}

impl Timer {
    fn new(kind: TickKind, active: bool, timeout: u64) -> Self {
        Timer {
            kind,
            active: AtomicBool::new(active),
            elapsed: AtomicU64::new(0),
            timeout: AtomicU64::new(timeout),
        }
    }

    /// Advance by one tick; true when the window elapsed.
    fn advance(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        let elapsed = self.elapsed.fetch_add(1, Ordering::AcqRel) + 1;
        elapsed >= self.timeout.load(Ordering::Acquire)
    }
}

/// Listener registry shared between the clock task and the raft loop.
pub struct TickControl {
    config: Arc<Config>,
    election: Timer,
    heartbeat: Timer,
    lease: Timer,
}

impl TickControl {
    pub fn new(config: Arc<Config>) -> Self {
        let election_timeout = config.new_rand_election_tick();
        TickControl {
            election: Timer::new(TickKind::Election, true, election_timeout),
            heartbeat: Timer::new(TickKind::Heartbeat, false, config.heartbeat_tick),
            lease: Timer::new(TickKind::Lease, false, config.lease_tick),
            config,
        }
    }

    fn timer(&self, kind: TickKind) -> &Timer {
        match kind {
            TickKind::Election => &self.election,
            TickKind::Heartbeat => &self.heartbeat,
            TickKind::Lease => &self.lease,
        }
    }

    pub fn add_listener(&self, kind: TickKind) {
        let timer = self.timer(kind);
        timer.active.store(true, Ordering::Release);
        self.reset(kind);
    }

    pub fn remove_listener(&self, kind: TickKind) {
        self.timer(kind).active.store(false, Ordering::Release);
    }

    /// Restart a timer's countdown; the election window is re-randomized.
    pub fn reset(&self, kind: TickKind) {
        let timer = self.timer(kind);
        timer.elapsed.store(0, Ordering::Release);
        if kind == TickKind::Election {
            timer.timeout.store(self.config.new_rand_election_tick(), Ordering::Release);
        }
    }

    /// Ticks since the election timer was last reset; a proxy for "how
    /// recently the leader was heard".
    pub fn election_elapsed(&self) -> u64 {
        self.election.elapsed.load(Ordering::Acquire)
    }

    fn on_tick(&self, channel: &RequestChannel) {
        for timer in [&self.election, &self.heartbeat, &self.lease] {
            if timer.advance() {
                self.reset(timer.kind);
                channel.tick.offer(timer.kind);
            }
        }
    }
}

/// The tick emitter task.
pub struct Clock;

impl Clock {
    pub fn spawn(
        control: Arc<TickControl>,
        channel: Arc<RequestChannel>,
    ) -> JoinHandle<()> {
        let interval = Duration::from_millis(control.config.tick_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if channel.is_closed() {
                    tracing::debug!("clock stops, channel closed");
                    return;
                }
                control.on_tick(&channel);
            }
        })
    }
}
