//! Log read backends layered over the write-ahead log.
//!
//! The WAL is the single source of durability; a [`Storage`] decides how
//! much of the live log stays in memory for reads. The raft loop reads
//! replication batches through this trait, the group-commit loop
//! publishes entries here once they are durable.

mod combination;
mod memory;
mod persistent;

use std::collections::VecDeque;
use std::sync::Arc;

pub use combination::CombinationStorage;
pub use memory::MemoryStorage;
pub use persistent::PersistentStorage;

use crate::config::StorageType;
use crate::error::StorageError;
use crate::wal::Wal;
use crate::Entry;

/// Read access to the stable portion of the log.
pub trait Storage: Send + Sync {
    /// Publish durable entries, contiguous with what is already held.
    fn append(&self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Entries in `[lo, hi)`.
    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, StorageError>;

    /// Term at `index`, `None` when the index is no longer retained.
    fn term(&self, index: u64) -> Result<Option<u64>, StorageError>;

    /// Lowest index readable without a snapshot.
    fn first_index(&self) -> u64;

    /// Highest stable index held (0 when empty).
    fn last_index(&self) -> u64;

    /// Drop entries with `index >= from` from the in-memory view.
    fn truncate_suffix(&self, from: u64);

    /// Release entries covered by a snapshot at `upto`.
    fn compact(&self, upto: u64) -> Result<(), StorageError>;
}

/// Pick a backend per configuration.
pub fn open(
    storage_type: StorageType,
    ring_buffer_size: usize,
    wal: Arc<Wal>,
) -> Arc<dyn Storage> {
    match storage_type {
        StorageType::Memory => Arc::new(MemoryStorage::new(wal)),
        StorageType::Disk => Arc::new(PersistentStorage::new(wal)),
        StorageType::Combination => Arc::new(CombinationStorage::new(ring_buffer_size, wal)),
    }
}

/// A contiguous window of entries, shared by the in-memory backends.
#[derive(Debug, Default)]
pub(crate) struct Window {
    entries: VecDeque<Entry>,
}

impl Window {
    pub(crate) fn first_index(&self) -> u64 {
        self.entries.front().map(|e| e.index).unwrap_or(0)
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.entries.back().map(|e| e.index).unwrap_or(0)
    }

    pub(crate) fn push(&mut self, entry: Entry) -> Result<(), StorageError> {
        if let Some(last) = self.entries.back() {
            if entry.index != last.index + 1 {
                return Err(StorageError::NonSequential {
                    expect: last.index + 1,
                    got: entry.index,
                });
            }
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub(crate) fn get(&self, index: u64) -> Option<&Entry> {
        let first = self.first_index();
        if first == 0 || index < first || index > self.last_index() {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    pub(crate) fn range(&self, lo: u64, hi: u64) -> Vec<Entry> {
        let first = self.first_index();
        if first == 0 || hi <= first {
            return Vec::new();
        }
        let lo = lo.max(first);
        self.entries
            .iter()
            .skip((lo - first) as usize)
            .take_while(|e| e.index < hi)
            .cloned()
            .collect()
    }

    pub(crate) fn truncate_suffix(&mut self, from: u64) {
        while matches!(self.entries.back(), Some(last) if last.index >= from) {
            self.entries.pop_back();
        }
    }

    pub(crate) fn compact(&mut self, upto: u64) {
        while matches!(self.entries.front(), Some(first) if first.index <= upto) {
            self.entries.pop_front();
        }
    }

    pub(crate) fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::EntryType;

    pub(crate) fn entry(term: u64, index: u64) -> Entry {
        Entry::new(EntryType::Normal, term, index, Bytes::from_static(b"w"))
    }

    #[test]
    fn window_push_and_range() {
        let mut w = Window::default();
        for i in 3..=7 {
            w.push(entry(1, i)).unwrap();
        }
        assert_eq!(w.first_index(), 3);
        assert_eq!(w.last_index(), 7);
        assert_eq!(w.range(1, 100).len(), 5);
        assert_eq!(w.range(4, 6).iter().map(|e| e.index).collect::<Vec<_>>(), vec![4, 5]);
        assert!(w.push(entry(1, 9)).is_err());
    }

    #[test]
    fn window_truncate_and_compact() {
        let mut w = Window::default();
        for i in 1..=5 {
            w.push(entry(1, i)).unwrap();
        }
        w.truncate_suffix(4);
        assert_eq!(w.last_index(), 3);
        w.compact(2);
        assert_eq!(w.first_index(), 3);
        w.evict_to(0);
        assert_eq!(w.first_index(), 0);
    }
}
