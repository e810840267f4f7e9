//! Everything-in-memory read backend.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{Storage, Window};
use crate::error::StorageError;
use crate::wal::Wal;
use crate::Entry;

/// Holds every live entry in memory; the WAL exists for durability and
/// restart replay only.
pub struct MemoryStorage {
    wal: Arc<Wal>,
    window: RwLock<Window>,
}

impl MemoryStorage {
    pub fn new(wal: Arc<Wal>) -> Self {
        MemoryStorage {
            wal,
            window: RwLock::new(Window::default()),
        }
    }
}

impl Storage for MemoryStorage {
    fn append(&self, entries: &[Entry]) -> Result<(), StorageError> {
        let mut window = self.window.write();
        for entry in entries {
            window.push(entry.clone())?;
        }
        Ok(())
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, StorageError> {
        Ok(self.window.read().range(lo, hi))
    }

    fn term(&self, index: u64) -> Result<Option<u64>, StorageError> {
        Ok(self.window.read().get(index).map(|e| e.term))
    }

    fn first_index(&self) -> u64 {
        self.window.read().first_index()
    }

    fn last_index(&self) -> u64 {
        self.window.read().last_index()
    }

    fn truncate_suffix(&self, from: u64) {
        self.window.write().truncate_suffix(from);
    }

    fn compact(&self, upto: u64) -> Result<(), StorageError> {
        self.window.write().compact(upto);
        self.wal.compact(upto)
    }
}
