//! The replicated log view: unstable tail in front of a stable store,
//! plus the shared watermark discipline
//! `first <= applied <= committed <= stable <= last`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::StorageError;
use crate::message::SnapshotMetadata;
use crate::storage::Storage;
use crate::Entry;

/// Cross-loop log indices. Each has a single writer: the raft loop owns
/// `committed` and `last`, the group-commit loop owns `stable`, the apply
/// loop owns `applied`. Readers take atomic loads, no lock.
#[derive(Debug, Default)]
pub struct Watermarks {
    first: AtomicU64,
    applied: AtomicU64,
    committed: AtomicU64,
    stable: AtomicU64,
    last: AtomicU64,
}

impl Watermarks {
    pub fn first(&self) -> u64 {
        self.first.load(Ordering::Acquire)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn stable(&self) -> u64 {
        self.stable.load(Ordering::Acquire)
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    pub fn set_first(&self, index: u64) {
        self.first.store(index, Ordering::Release);
    }

    pub fn set_last(&self, index: u64) {
        self.last.store(index, Ordering::Release);
    }

    /// Monotone, idempotent advance; reports whether it moved.
    pub fn applied_to(&self, index: u64) -> bool {
        self.applied.fetch_max(index, Ordering::AcqRel) < index
    }

    /// Monotone commit advance; the committed index never decreases.
    pub fn commit_to(&self, index: u64) -> bool {
        self.committed.fetch_max(index, Ordering::AcqRel) < index
    }

    pub fn stable_to(&self, index: u64) -> bool {
        self.stable.fetch_max(index, Ordering::AcqRel) < index
    }
}

/// Append-only log view owned by the raft loop.
pub struct RaftLog {
    store: Arc<dyn Storage>,
    marks: Arc<Watermarks>,
    /// Entries past the stable index, not yet published by group commit.
    unstable: VecDeque<Entry>,
    /// Metadata of the newest snapshot; `(0, 0)` when none exists.
    snapshot_meta: SnapshotMetadata,
}

impl RaftLog {
    pub fn new(store: Arc<dyn Storage>, marks: Arc<Watermarks>) -> Self {
        RaftLog {
            store,
            marks,
            unstable: VecDeque::new(),
            snapshot_meta: SnapshotMetadata::default(),
        }
    }

    /// Seed the view after startup replay: the snapshot boundary and the
    /// entries recovered from the WAL (already stable).
    pub fn recover(&mut self, snapshot: SnapshotMetadata, last_index: u64) {
        self.snapshot_meta = snapshot;
        let first = if snapshot.index == 0 { 1 } else { snapshot.index + 1 };
        self.marks.set_first(first);
        self.marks.set_last(last_index.max(snapshot.index));
        self.marks.applied_to(snapshot.index);
        self.marks.commit_to(snapshot.index);
        self.marks.stable_to(last_index.max(snapshot.index));
    }

    pub fn marks(&self) -> &Arc<Watermarks> {
        &self.marks
    }

    pub fn first_index(&self) -> u64 {
        self.marks.first()
    }

    pub fn last_index(&self) -> u64 {
        self.marks.last()
    }

    pub fn applied(&self) -> u64 {
        self.marks.applied()
    }

    pub fn committed(&self) -> u64 {
        self.marks.committed()
    }

    pub fn stable(&self) -> u64 {
        self.marks.stable()
    }

    pub fn snapshot_meta(&self) -> SnapshotMetadata {
        self.snapshot_meta
    }

    pub fn last_term(&self) -> u64 {
        let last = self.last_index();
        if last == 0 {
            return 0;
        }
        self.term(last).unwrap_or(0)
    }

    /// Append contiguous entries. The caller resolves conflicts first;
    /// a gap or a term regression on a committed index is refused.
    pub fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }

        let committed = self.committed();
        let mut expect = self.last_index() + 1;
        for entry in entries {
            if entry.index != expect {
                return Err(StorageError::NonSequential {
                    expect,
                    got: entry.index,
                });
            }
            if entry.index <= committed {
                let existing = self.term(entry.index)?;
                if existing != entry.term {
                    return Err(StorageError::TermRegression {
                        index: entry.index,
                        existing,
                        incoming: entry.term,
                    });
                }
            }
            expect += 1;
        }

        self.unstable.extend(entries.iter().cloned());
        self.marks.set_last(entries.last().unwrap().index);
        Ok(())
    }

    /// Drop the uncommitted suffix starting at `from`.
    pub fn truncate_suffix(&mut self, from: u64) -> Result<(), StorageError> {
        let committed = self.committed();
        if from <= committed {
            return Err(StorageError::TruncateCommitted {
                index: from,
                committed,
            });
        }
        if from > self.last_index() {
            return Ok(());
        }

        while matches!(self.unstable.back(), Some(last) if last.index >= from) {
            self.unstable.pop_back();
        }
        // The store keeps its stale suffix until the group-commit loop
        // overwrites it; reads mask it through the unstable tail.
        self.marks.set_last(from - 1);
        Ok(())
    }

    /// Entries in `[lo, hi)`, stitched from the stable store and the
    /// unstable tail (the tail wins on overlap).
    pub fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, StorageError> {
        let hi = hi.min(self.last_index() + 1);
        if lo >= hi {
            return Ok(Vec::new());
        }
        if lo < self.first_index() {
            return Err(StorageError::OutOfRange {
                index: lo,
                first: self.first_index(),
                last: self.last_index(),
            });
        }

        let boundary = self.unstable.front().map(|e| e.index).unwrap_or(hi);

        let mut out = Vec::with_capacity((hi - lo) as usize);
        if lo < boundary {
            out.extend(self.store.entries(lo, hi.min(boundary))?);
        }
        if hi > boundary {
            let skip = lo.saturating_sub(boundary) as usize;
            out.extend(
                self.unstable
                    .iter()
                    .skip(skip)
                    .take_while(|e| e.index < hi)
                    .cloned(),
            );
        }

        if out.first().map(|e| e.index) != Some(lo) || out.len() != (hi - lo) as usize {
            return Err(StorageError::OutOfRange {
                index: lo,
                first: self.first_index(),
                last: self.last_index(),
            });
        }
        Ok(out)
    }

    /// Term of the entry at `index`; the snapshot boundary answers for
    /// compacted indices.
    pub fn term(&self, index: u64) -> Result<u64, StorageError> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.snapshot_meta.index {
            return Ok(self.snapshot_meta.term);
        }

        if let Some(front) = self.unstable.front() {
            if index >= front.index {
                return self
                    .unstable
                    .get((index - front.index) as usize)
                    .map(|e| e.term)
                    .ok_or(StorageError::OutOfRange {
                        index,
                        first: self.first_index(),
                        last: self.last_index(),
                    });
            }
        }

        self.store.term(index)?.ok_or(StorageError::OutOfRange {
            index,
            first: self.first_index(),
            last: self.last_index(),
        })
    }

    /// `(prev_index, prev_term)` matching check for append handling.
    pub fn match_term(&self, index: u64, term: u64) -> bool {
        self.term(index).map(|t| t == term).unwrap_or(false)
    }

    /// Whether a candidate's `(last_log_term, last_log_index)` is at
    /// least as up-to-date as ours.
    pub fn is_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_term = self.last_term();
        if last_log_term != our_term {
            last_log_term > our_term
        } else {
            last_log_index >= self.last_index()
        }
    }

    /// First incoming entry whose term conflicts with the local log, if
    /// any. Entries already present with the same term are skipped.
    pub fn find_conflict(&self, entries: &[Entry]) -> Option<u64> {
        for entry in entries {
            if entry.index > self.last_index() {
                return Some(entry.index);
            }
            if !self.match_term(entry.index, entry.term) {
                return Some(entry.index);
            }
        }
        None
    }

    /// Group commit made everything up to `index` durable: publish the
    /// watermark and drop the covered unstable prefix.
    pub fn stable_to(&mut self, index: u64) {
        self.marks.stable_to(index);
        while matches!(self.unstable.front(), Some(first) if first.index <= index) {
            self.unstable.pop_front();
        }
    }

    /// Monotone, idempotent applied advance.
    pub fn applied_to(&self, index: u64) -> bool {
        self.marks.applied_to(index)
    }

    /// Advance the commit index, never decreasing it.
    pub fn maybe_commit(&self, index: u64) -> bool {
        if index <= self.committed() {
            return false;
        }
        self.marks.commit_to(index.min(self.last_index()))
    }

    /// Install a snapshot boundary. The whole local log is superseded:
    /// the view restarts right after the snapshot, and the group-commit
    /// loop resets the WAL and store when it processes the batch.
    pub fn apply_snapshot_meta(&mut self, meta: SnapshotMetadata) {
        self.snapshot_meta = meta;
        self.unstable.clear();
        self.marks.set_first(meta.index + 1);
        self.marks.set_last(meta.index);
        self.marks.commit_to(meta.index);
        self.marks.stable_to(meta.index);
    }

    /// Record a locally built snapshot so the boundary keeps answering
    /// term queries after compaction.
    pub fn note_snapshot(&mut self, meta: SnapshotMetadata) {
        if meta.index > self.snapshot_meta.index {
            self.snapshot_meta = meta;
        }
    }

    /// Drop entries covered by the snapshot at `upto`.
    pub fn compact(&mut self, upto: u64) -> Result<(), StorageError> {
        let applied = self.applied();
        let upto = upto.min(applied);
        if upto < self.first_index() {
            return Ok(());
        }
        self.store.compact(upto)?;
        self.marks.set_first(upto + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::EntryType;
    use crate::storage::MemoryStorage;
    use crate::wal::Wal;

    fn entry(term: u64, index: u64) -> Entry {
        Entry::new(EntryType::Normal, term, index, Bytes::from_static(b"d"))
    }

    fn raft_log() -> (tempfile::TempDir, RaftLog) {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path(), 1 << 20).unwrap());
        let store = Arc::new(MemoryStorage::new(wal));
        let marks = Arc::new(Watermarks::default());
        let mut log = RaftLog::new(store, marks);
        log.recover(SnapshotMetadata::default(), 0);
        (dir, log)
    }

    #[test]
    fn watermark_ordering_holds() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();

        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 3);

        log.stable_to(3);
        assert!(log.maybe_commit(2));
        assert!(log.applied_to(1));

        let m = log.marks();
        assert!(m.first() <= m.applied());
        assert!(m.applied() <= m.committed());
        assert!(m.committed() <= m.stable());
        assert!(m.stable() <= m.last());
    }

    #[test]
    fn applied_to_is_idempotent_and_monotone() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        log.stable_to(2);
        log.maybe_commit(2);

        assert!(log.applied_to(2));
        assert!(!log.applied_to(2));
        assert!(!log.applied_to(1));
        assert_eq!(log.applied(), 2);
    }

    #[test]
    fn commit_never_decreases() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        log.stable_to(2);

        assert!(log.maybe_commit(2));
        assert!(!log.maybe_commit(1));
        assert_eq!(log.committed(), 2);
    }

    #[test]
    fn append_rejects_gap() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1)]).unwrap();
        assert!(matches!(
            log.append(&[entry(1, 3)]),
            Err(StorageError::NonSequential { expect: 2, got: 3 })
        ));
    }

    #[test]
    fn truncate_refuses_committed_prefix() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
        log.stable_to(3);
        log.maybe_commit(2);

        assert!(matches!(
            log.truncate_suffix(2),
            Err(StorageError::TruncateCommitted { .. })
        ));
        log.truncate_suffix(3).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn conflict_detection() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();

        // Same entries: no conflict.
        assert_eq!(log.find_conflict(&[entry(1, 2), entry(1, 3)]), None);
        // Diverging term at 3.
        assert_eq!(log.find_conflict(&[entry(1, 2), entry(2, 3)]), Some(3));
        // Past the end.
        assert_eq!(log.find_conflict(&[entry(1, 4)]), Some(4));
    }

    #[test]
    fn entries_stitch_stable_and_unstable() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        // Publish 1..=2 to the store, as group commit would.
        log.store.append(&log.entries(1, 3).unwrap()).unwrap();
        log.stable_to(2);
        log.append(&[entry(2, 3), entry(2, 4)]).unwrap();

        let all = log.entries(1, 5).unwrap();
        assert_eq!(all.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(all[3].term, 2);
        assert_eq!(log.term(2).unwrap(), 1);
        assert_eq!(log.term(4).unwrap(), 2);
    }

    #[test]
    fn snapshot_boundary_supersedes_log() {
        let (_dir, mut log) = raft_log();
        log.apply_snapshot_meta(SnapshotMetadata { index: 1000, term: 7 });

        assert_eq!(log.first_index(), 1001);
        assert_eq!(log.last_index(), 1000);
        assert_eq!(log.term(1000).unwrap(), 7);
        assert!(log.match_term(1000, 7));
        assert_eq!(log.committed(), 1000);

        // Appends continue right after the snapshot.
        log.append(&[entry(7, 1001)]).unwrap();
        assert_eq!(log.last_index(), 1001);
    }

    #[test]
    fn up_to_date_check() {
        let (_dir, mut log) = raft_log();
        log.append(&[entry(1, 1), entry(2, 2)]).unwrap();

        assert!(log.is_up_to_date(1, 3)); // higher term wins
        assert!(log.is_up_to_date(2, 2)); // equal is enough
        assert!(log.is_up_to_date(5, 2)); // longer same-term log
        assert!(!log.is_up_to_date(5, 1)); // lower term loses
    }
}
