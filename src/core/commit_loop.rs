//! The group-commit loop.
//!
//! Single-threaded consumer of READY. Queued batches are coalesced under
//! one durability barrier: every batch's entries are appended first, one
//! flush covers them all, and only then are apply batches enqueued,
//! messages dispatched and advances acknowledged, per batch, in order.
//!
//! A WAL failure rejects the failing batch and every batch queued behind
//! it atomically: none of their messages are sent, no apply is enqueued,
//! and the advance carries `accepted = false` so the raft loop retries
//! from the last durable watermark.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::channel::{Advance, Apply, Inbound, RequestChannel};
use crate::engine::Ready;
use crate::log::Watermarks;
use crate::network::Transporter;
use crate::node::Cluster;
use crate::storage::Storage;
use crate::wal::Wal;

pub struct CommitLoop {
    channel: Arc<RequestChannel>,
    wal: Arc<Wal>,
    storage: Arc<dyn Storage>,
    transporter: Arc<dyn Transporter>,
    cluster: Arc<Cluster>,
    marks: Arc<Watermarks>,
    idle_timeout: Duration,
}

impl CommitLoop {
    pub fn spawn(
        channel: Arc<RequestChannel>,
        wal: Arc<Wal>,
        storage: Arc<dyn Storage>,
        transporter: Arc<dyn Transporter>,
        cluster: Arc<Cluster>,
        marks: Arc<Watermarks>,
    ) -> JoinHandle<()> {
        let commit_loop = CommitLoop {
            channel,
            wal,
            storage,
            transporter,
            cluster,
            marks,
            idle_timeout: Duration::from_millis(500),
        };
        tokio::spawn(commit_loop.run())
    }

    async fn run(self) {
        tracing::info!("group commit loop started");

        loop {
            if self.channel.is_closed() && self.channel.ready.is_empty() {
                break;
            }

            self.channel.ready.ensure(self.idle_timeout).await;
            self.channel.ready.set_can_fetch(false);

            let batches = self.channel.ready.drain();
            if batches.is_empty() {
                continue;
            }
            self.group_commit(batches).await;
        }

        tracing::info!("group commit loop stopped");
    }

    async fn group_commit(&self, batches: Vec<Ready>) {
        // Phase one: make every batch durable under a single barrier.
        // The first failure poisons the rest; a later batch could not be
        // appended past a hole anyway.
        let mut ok = Vec::with_capacity(batches.len());
        let mut appended_any = false;
        let mut failed = false;

        for ready in &batches {
            if failed {
                ok.push(false);
                continue;
            }
            match self.persist(ready) {
                Ok(wrote) => {
                    appended_any |= wrote;
                    ok.push(true);
                }
                Err(e) => {
                    tracing::error!(error = %e, "wal append failed, rejecting batch");
                    ok.push(false);
                    failed = true;
                }
            }
        }

        if appended_any {
            if let Err(e) = self.wal.flush() {
                tracing::error!(error = %e, "wal flush failed, rejecting cycle");
                ok.iter_mut().for_each(|b| *b = false);
            }
        }

        let stable = self.wal.last_index();

        // Phase two: per batch, publish and acknowledge in order.
        for (ready, accepted) in batches.into_iter().zip(ok) {
            if accepted {
                self.finish(ready, stable).await;
            } else {
                self.reject(ready, stable);
            }
        }
    }

    /// Hard state and entries of one batch into the WAL. Returns whether
    /// anything was written.
    fn persist(&self, ready: &Ready) -> Result<bool, crate::error::StorageError> {
        let mut wrote = false;

        if let Some(hs) = ready.hard_state {
            self.wal.save_hard_state(hs)?;
            wrote = true;
        }

        // A snapshot install supersedes the entire local log; the WAL
        // restarts after the boundary so later appends stay contiguous.
        if ready.snapshot.is_some() {
            self.wal.truncate_suffix(0)?;
            self.storage.truncate_suffix(0);
            wrote = true;
        }

        if let Some(first) = ready.entries.first().map(|e| e.index) {
            // An overwrite of a conflicting suffix truncates before the
            // append; contiguity is checked by the WAL itself.
            if first <= self.wal.last_index() {
                self.wal.truncate_suffix(first)?;
                self.storage.truncate_suffix(first);
            }
            self.wal.append(&ready.entries)?;
            wrote = true;
        }

        Ok(wrote)
    }

    async fn finish(&self, ready: Ready, stable: u64) {
        let applied_enqueued = ready.apply_hi().unwrap_or(0);

        // Committed entries must be durable before they are applied.
        if applied_enqueued > stable {
            tracing::error!(
                applied_enqueued,
                stable,
                "apply batch ahead of durable watermark, rejecting"
            );
            self.reject(ready, stable);
            return;
        }

        if !ready.entries.is_empty() {
            if let Err(e) = self.storage.append(&ready.entries) {
                tracing::error!(error = %e, "storage publish failed");
            }
            self.marks.stable_to(stable);
        }

        if !ready.committed_entries.is_empty() || ready.snapshot.is_some() {
            self.cluster.local().set_applying(true);
            self.channel.apply.offer(Apply {
                committed_entries: ready.committed_entries,
                snapshot: ready.snapshot,
                responders: ready.responders,
            });
        }

        for message in ready.messages {
            self.dispatch(message).await;
        }

        self.channel.advance.offer(Advance {
            stable_index: stable,
            applied_enqueued,
            accepted: true,
            responders: BTreeMap::new(),
            epoch: ready.epoch,
        });
    }

    fn reject(&self, ready: Ready, stable: u64) {
        self.channel.advance.offer(Advance {
            stable_index: stable,
            applied_enqueued: 0,
            accepted: false,
            responders: ready.responders,
            epoch: ready.epoch,
        });
    }

    async fn dispatch(&self, message: crate::message::Message) {
        let to = message.to;
        match self.transporter.send(message).await {
            Ok(()) => {
                if let Some(peer) = self.cluster.get(to) {
                    if peer.is_disconnected() {
                        self.channel.message.offer(Inbound::PeerState {
                            id: to,
                            connected: true,
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!(to, error = %e, "message dispatch failed");
                if let Some(peer) = self.cluster.get(to) {
                    if !peer.is_disconnected() {
                        self.channel.message.offer(Inbound::PeerState {
                            id: to,
                            connected: false,
                        });
                    }
                }
            }
        }
    }
}
