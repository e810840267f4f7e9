//! Ring-buffer read backend: a bounded hot window in memory, cold reads
//! fall through to the WAL.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{Storage, Window};
use crate::error::StorageError;
use crate::wal::Wal;
use crate::Entry;

pub struct CombinationStorage {
    capacity: usize,
    wal: Arc<Wal>,
    ring: RwLock<Window>,
}

impl CombinationStorage {
    pub fn new(capacity: usize, wal: Arc<Wal>) -> Self {
        CombinationStorage {
            capacity,
            wal,
            ring: RwLock::new(Window::default()),
        }
    }
}

impl Storage for CombinationStorage {
    fn append(&self, entries: &[Entry]) -> Result<(), StorageError> {
        let mut ring = self.ring.write();
        for entry in entries {
            ring.push(entry.clone())?;
        }
        ring.evict_to(self.capacity);
        Ok(())
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, StorageError> {
        let ring = self.ring.read();
        let ring_first = ring.first_index();

        if ring_first != 0 && lo >= ring_first {
            return Ok(ring.range(lo, hi));
        }

        // Cold prefix from the WAL, hot suffix from the ring.
        let cold_hi = if ring_first == 0 { hi } else { hi.min(ring_first) };
        let mut out = self.wal.entries(lo, cold_hi)?;
        if ring_first != 0 && hi > ring_first {
            out.extend(ring.range(ring_first, hi));
        }
        Ok(out)
    }

    fn term(&self, index: u64) -> Result<Option<u64>, StorageError> {
        if let Some(entry) = self.ring.read().get(index) {
            return Ok(Some(entry.term));
        }
        Ok(self.wal.entry_at(index)?.map(|e| e.term))
    }

    fn first_index(&self) -> u64 {
        let wal_first = self.wal.first_index();
        if wal_first != 0 {
            wal_first
        } else {
            self.ring.read().first_index()
        }
    }

    fn last_index(&self) -> u64 {
        let ring_last = self.ring.read().last_index();
        if ring_last != 0 {
            ring_last
        } else {
            self.wal.last_index()
        }
    }

    fn truncate_suffix(&self, from: u64) {
        self.ring.write().truncate_suffix(from);
    }

    fn compact(&self, upto: u64) -> Result<(), StorageError> {
        self.ring.write().compact(upto);
        self.wal.compact(upto)
    }
}
