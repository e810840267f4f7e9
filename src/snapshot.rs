//! Snapshot persistence, indexed by `(index, term)`.

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message as _;

use crate::error::StorageError;
use crate::message::{Snapshot, SnapshotMetadata};

fn snapshot_name(meta: SnapshotMetadata) -> String {
    format!("{:020}-{:020}.snap", meta.index, meta.term)
}

fn parse_snapshot_name(name: &str) -> Option<SnapshotMetadata> {
    let stem = name.strip_suffix(".snap")?;
    let (index, term) = stem.split_once('-')?;
    Some(SnapshotMetadata {
        index: index.parse().ok()?,
        term: term.parse().ok()?,
    })
}

/// File-per-snapshot store with a count-based retention sweep.
pub struct Snapshotter {
    dir: PathBuf,
    read_only: bool,
    min_retention: usize,
    index: Mutex<BTreeMap<u64, SnapshotMetadata>>,
}

impl Snapshotter {
    pub fn open(
        dir: impl AsRef<Path>,
        read_only: bool,
        min_retention: usize,
    ) -> Result<Snapshotter, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io("create snapshot dir", e))?;

        let mut index = BTreeMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| StorageError::io("list snapshot dir", e))? {
            let entry = entry.map_err(|e| StorageError::io("list snapshot dir", e))?;
            if let Some(meta) = parse_snapshot_name(&entry.file_name().to_string_lossy()) {
                index.insert(meta.index, meta);
            }
        }

        tracing::info!(dir = %dir.display(), snapshots = index.len(), "snapshotter opened");
        Ok(Snapshotter {
            dir,
            read_only,
            min_retention,
            index: Mutex::new(index),
        })
    }

    /// Persist a snapshot and sweep retention.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let meta = snapshot.metadata();
        let path = self.dir.join(snapshot_name(meta));
        let tmp = path.with_extension("tmp");

        let buf = snapshot.encode_to_vec();
        {
            let mut file = File::create(&tmp).map_err(|e| StorageError::io("create snapshot", e))?;
            file.write_all(&buf).map_err(|e| StorageError::io("write snapshot", e))?;
            file.sync_data().map_err(|e| StorageError::io("sync snapshot", e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StorageError::io("rename snapshot", e))?;

        let mut index = self.index.lock();
        index.insert(meta.index, meta);
        self.sweep(&mut index);

        tracing::info!(index = meta.index, term = meta.term, "snapshot saved");
        Ok(())
    }

    /// All retained snapshots, ordered by index.
    pub fn snapshots(&self) -> BTreeMap<u64, SnapshotMetadata> {
        self.index.lock().clone()
    }

    pub fn latest(&self) -> Option<SnapshotMetadata> {
        self.index.lock().values().next_back().copied()
    }

    pub fn load(&self, index: u64) -> Result<Snapshot, StorageError> {
        let meta = self
            .index
            .lock()
            .get(&index)
            .copied()
            .ok_or(StorageError::SnapshotNotFound { index })?;

        let path = self.dir.join(snapshot_name(meta));
        let buf = fs::read(&path).map_err(|e| StorageError::io("read snapshot", e))?;
        let snapshot = Snapshot::decode(buf.as_slice()).map_err(|e| StorageError::Corrupt {
            index,
            reason: format!("snapshot decode: {e}"),
        })?;
        if snapshot.metadata() != meta {
            return Err(StorageError::Corrupt {
                index,
                reason: "snapshot metadata mismatch".to_string(),
            });
        }
        Ok(snapshot)
    }

    pub fn load_latest(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.latest() {
            Some(meta) => self.load(meta.index).map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot body for state-machine handoff: zero-copy when the store
    /// is configured read-only, otherwise a private copy.
    pub fn body(&self, snapshot: &Snapshot) -> Bytes {
        if self.read_only {
            snapshot.data.clone()
        } else {
            Bytes::copy_from_slice(&snapshot.data)
        }
    }

    fn sweep(&self, index: &mut BTreeMap<u64, SnapshotMetadata>) {
        while index.len() > self.min_retention {
            let (oldest, meta) = match index.iter().next() {
                Some((k, v)) => (*k, *v),
                None => break,
            };
            let path = self.dir.join(snapshot_name(meta));
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(index = oldest, error = %e, "failed to prune snapshot");
                break;
            }
            index.remove(&oldest);
            tracing::debug!(index = oldest, "snapshot pruned");
        }
    }
}
