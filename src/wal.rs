//! Write-ahead log: append-only, sequential-write segments.
//!
//! Each record is `[len: u32][crc: u32][payload]` little-endian, where the
//! payload is a prost-encoded [`Entry`]. Segment files are named by the
//! index of their first record (`{index:020}.wal`). Replay validates CRCs
//! and contiguity; a torn tail record in the newest segment is truncated
//! away, corruption anywhere else is fatal.
//!
//! Durable election state `(term, vote)` lives in a `HARDSTATE` sidecar in
//! the same directory, replaced by atomic rename.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::Mutex;
use prost::Message as _;

use crate::error::StorageError;
use crate::message::HardState;
use crate::Entry;

const RECORD_HEADER: usize = 8;
const HARD_STATE_FILE: &str = "HARDSTATE";

fn segment_name(first_index: u64) -> String {
    format!("{first_index:020}.wal")
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_suffix(".wal")?.parse().ok()
}

#[derive(Debug, Clone)]
struct SegmentMeta {
    first_index: u64,
    /// Index after the last record in this segment.
    next_index: u64,
    path: PathBuf,
}

#[derive(Debug)]
struct WalInner {
    segments: Vec<SegmentMeta>,
    /// Writer for the newest segment. `None` until the first append after
    /// open (or after a truncation that emptied the log).
    active: Option<File>,
    active_size: u64,
    last_entry: Option<Entry>,
}

/// Segmented write-ahead log. Internally synchronized; the group-commit
/// loop is the only writer by discipline.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    segment_bytes: u64,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open the log in `dir`, replaying and validating existing segments.
    pub fn open(dir: impl AsRef<Path>, segment_bytes: u64) -> Result<Wal, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io("create wal dir", e))?;

        let mut firsts: Vec<u64> = fs::read_dir(&dir)
            .map_err(|e| StorageError::io("list wal dir", e))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_segment_name(&entry.file_name().to_string_lossy()))
            .collect();
        firsts.sort_unstable();

        let mut segments = Vec::new();
        let mut last_entry: Option<Entry> = None;
        let mut active_size = 0;

        for (i, first_index) in firsts.iter().copied().enumerate() {
            let path = dir.join(segment_name(first_index));
            let newest = i + 1 == firsts.len();
            let (entries, valid_len) = read_segment(&path, newest)?;

            let mut next_index = first_index;
            for entry in entries {
                if entry.index != next_index {
                    return Err(StorageError::Corrupt {
                        index: entry.index,
                        reason: format!("expect index {next_index} in {}", path.display()),
                    });
                }
                next_index += 1;
                last_entry = Some(entry);
            }

            if newest {
                active_size = valid_len;
            }
            segments.push(SegmentMeta {
                first_index,
                next_index,
                path,
            });
        }

        // Cross-segment contiguity.
        for pair in segments.windows(2) {
            if pair[0].next_index != pair[1].first_index {
                return Err(StorageError::Corrupt {
                    index: pair[1].first_index,
                    reason: "gap between wal segments".to_string(),
                });
            }
        }

        let active = match segments.last() {
            Some(meta) => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&meta.path)
                    .map_err(|e| StorageError::io("open active segment", e))?;
                Some(file)
            }
            None => None,
        };

        tracing::info!(
            dir = %dir.display(),
            segments = segments.len(),
            last_index = last_entry.as_ref().map(|e| e.index).unwrap_or(0),
            "wal opened"
        );

        Ok(Wal {
            dir,
            segment_bytes,
            inner: Mutex::new(WalInner {
                segments,
                active,
                active_size,
                last_entry,
            }),
        })
    }

    pub fn first_index(&self) -> u64 {
        let inner = self.inner.lock();
        inner.segments.first().map(|s| s.first_index).unwrap_or(0)
    }

    pub fn last_index(&self) -> u64 {
        let inner = self.inner.lock();
        inner.last_entry.as_ref().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_entry(&self) -> Option<Entry> {
        self.inner.lock().last_entry.clone()
    }

    /// Append a contiguous batch. Entries must continue the log without a
    /// gap; overwrites go through [`Wal::truncate_suffix`] first.
    pub fn append(&self, entries: &[Entry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock();

        let mut expect = match &inner.last_entry {
            Some(last) => last.index + 1,
            None => entries[0].index,
        };

        for entry in entries {
            if entry.index != expect {
                return Err(StorageError::NonSequential {
                    expect,
                    got: entry.index,
                });
            }
            expect += 1;
        }

        for entry in entries {
            self.roll_if_needed(&mut inner, entry.index)?;

            let payload = entry.encode_to_vec();
            let crc = crc32fast::hash(&payload);
            let mut record = Vec::with_capacity(RECORD_HEADER + payload.len());
            record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            record.extend_from_slice(&crc.to_le_bytes());
            record.extend_from_slice(&payload);

            let file = inner.active.as_mut().expect("active segment after roll");
            file.write_all(&record)
                .map_err(|e| StorageError::io("append wal record", e))?;

            inner.active_size += record.len() as u64;
            let meta = inner.segments.last_mut().expect("segment after roll");
            meta.next_index = entry.index + 1;
            inner.last_entry = Some(entry.clone());
        }

        Ok(())
    }

    /// Durability barrier for everything appended so far.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.active.as_mut() {
            file.flush().map_err(|e| StorageError::io("flush wal", e))?;
            file.sync_data().map_err(|e| StorageError::io("sync wal", e))?;
        }
        Ok(())
    }

    /// Entries in `[lo, hi)`, validated against their stored CRCs.
    pub fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, StorageError> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for meta in &inner.segments {
            if meta.next_index <= lo || meta.first_index >= hi {
                continue;
            }
            let (entries, _) = read_segment(&meta.path, false)?;
            for entry in entries {
                if entry.index >= lo && entry.index < hi {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// A single entry, or `None` when outside the retained range.
    pub fn entry_at(&self, index: u64) -> Result<Option<Entry>, StorageError> {
        Ok(self.entries(index, index + 1)?.pop())
    }

    /// Drop all records with `index >= from`.
    pub fn truncate_suffix(&self, from: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();

        if inner.segments.is_empty() || from >= inner.segments.last().unwrap().next_index {
            return Ok(());
        }

        // Remove whole segments past the cut.
        while let Some(meta) = inner.segments.last() {
            if meta.first_index >= from {
                fs::remove_file(&meta.path).map_err(|e| StorageError::io("remove segment", e))?;
                inner.segments.pop();
                inner.active = None;
                inner.active_size = 0;
            } else {
                break;
            }
        }

        // Cut the segment containing `from`.
        let needs_cut = inner.segments.last().map(|m| m.next_index > from).unwrap_or(false);
        if needs_cut {
            let path = inner.segments.last().unwrap().path.clone();
            let keep = record_offset(&path, from)?;
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| StorageError::io("open segment for truncate", e))?;
            file.set_len(keep)
                .map_err(|e| StorageError::io("truncate segment", e))?;
            file.sync_data().map_err(|e| StorageError::io("sync truncated segment", e))?;
            inner.segments.last_mut().unwrap().next_index = from;
            inner.active = None;
            inner.active_size = 0;
        }

        // Reopen the newest remaining segment for appends and refresh the
        // cached last entry.
        inner.last_entry = None;
        if let Some(meta) = inner.segments.last().cloned() {
            let (entries, valid_len) = read_segment(&meta.path, false)?;
            inner.last_entry = entries.into_iter().last();
            let file = OpenOptions::new()
                .append(true)
                .open(&meta.path)
                .map_err(|e| StorageError::io("reopen active segment", e))?;
            inner.active = Some(file);
            inner.active_size = valid_len;
        }

        tracing::info!(from, "wal suffix truncated");
        Ok(())
    }

    /// Drop whole segments entirely covered by a snapshot at `upto`.
    pub fn compact(&self, upto: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        while inner.segments.len() > 1 {
            let first = &inner.segments[0];
            if first.next_index <= upto + 1 {
                fs::remove_file(&first.path).map_err(|e| StorageError::io("remove segment", e))?;
                inner.segments.remove(0);
                removed += 1;
            } else {
                break;
            }
        }
        if removed > 0 {
            tracing::info!(upto, removed, "wal compacted");
        }
        Ok(())
    }

    pub fn save_hard_state(&self, hs: HardState) -> Result<(), StorageError> {
        let payload = hs.encode_to_vec();
        let crc = crc32fast::hash(&payload);
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&payload);

        let tmp = self.dir.join(format!("{HARD_STATE_FILE}.tmp"));
        let path = self.dir.join(HARD_STATE_FILE);
        {
            let mut file = File::create(&tmp).map_err(|e| StorageError::io("create hard state", e))?;
            file.write_all(&buf).map_err(|e| StorageError::io("write hard state", e))?;
            file.sync_data().map_err(|e| StorageError::io("sync hard state", e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StorageError::io("rename hard state", e))?;
        Ok(())
    }

    pub fn load_hard_state(&self) -> Result<Option<HardState>, StorageError> {
        let path = self.dir.join(HARD_STATE_FILE);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io("read hard state", e)),
        };
        if buf.len() < 4 {
            return Err(StorageError::Corrupt {
                index: 0,
                reason: "short hard state file".to_string(),
            });
        }
        let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let payload = &buf[4..];
        if crc32fast::hash(payload) != crc {
            return Err(StorageError::Corrupt {
                index: 0,
                reason: "hard state crc mismatch".to_string(),
            });
        }
        let hs = HardState::decode(payload).map_err(|e| StorageError::Corrupt {
            index: 0,
            reason: format!("hard state decode: {e}"),
        })?;
        Ok(Some(hs))
    }

    fn roll_if_needed(&self, inner: &mut WalInner, index: u64) -> Result<(), StorageError> {
        let need_new = match &inner.active {
            None => true,
            Some(_) => inner.active_size >= self.segment_bytes,
        };
        if !need_new {
            return Ok(());
        }

        let path = self.dir.join(segment_name(index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io("create segment", e))?;
        inner.segments.push(SegmentMeta {
            first_index: index,
            next_index: index,
            path,
        });
        inner.active = Some(file);
        inner.active_size = 0;
        Ok(())
    }
}

/// Decode a whole segment. With `tolerate_torn_tail`, a short or
/// corrupt record at the end is cut off (and the file truncated to the
/// last valid record) instead of failing.
fn read_segment(path: &Path, tolerate_torn_tail: bool) -> Result<(Vec<Entry>, u64), StorageError> {
    let mut file = File::open(path).map_err(|e| StorageError::io("open segment", e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| StorageError::io("read segment", e))?;

    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let record = decode_record(&buf[offset..]);
        match record {
            Ok((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            Err(reason) => {
                if tolerate_torn_tail {
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        reason,
                        "torn wal tail truncated"
                    );
                    let file = OpenOptions::new()
                        .write(true)
                        .open(path)
                        .map_err(|e| StorageError::io("open segment for repair", e))?;
                    file.set_len(offset as u64)
                        .map_err(|e| StorageError::io("repair segment", e))?;
                    break;
                }
                let index = entries.last().map(|e: &Entry| e.index + 1).unwrap_or(0);
                return Err(StorageError::Corrupt {
                    index,
                    reason: format!("{reason} in {}", path.display()),
                });
            }
        }
    }

    Ok((entries, offset as u64))
}

fn decode_record(buf: &[u8]) -> Result<(Entry, usize), String> {
    if buf.len() < RECORD_HEADER {
        return Err("short record header".to_string());
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if buf.len() < RECORD_HEADER + len {
        return Err("short record payload".to_string());
    }
    let payload = &buf[RECORD_HEADER..RECORD_HEADER + len];
    if crc32fast::hash(payload) != crc {
        return Err("record crc mismatch".to_string());
    }
    let entry = Entry::decode(payload).map_err(|e| format!("record decode: {e}"))?;
    if !entry.validate_crc() {
        return Err("entry crc mismatch".to_string());
    }
    Ok((entry, RECORD_HEADER + len))
}

/// Byte offset of the record holding `index` inside a segment file.
fn record_offset(path: &Path, index: u64) -> Result<u64, StorageError> {
    let mut file = File::open(path).map_err(|e| StorageError::io("open segment", e))?;
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io("seek segment", e))?;
    file.read_to_end(&mut buf).map_err(|e| StorageError::io("read segment", e))?;

    let mut offset = 0usize;
    while offset < buf.len() {
        let (entry, consumed) =
            decode_record(&buf[offset..]).map_err(|reason| StorageError::Corrupt {
                index,
                reason,
            })?;
        if entry.index >= index {
            return Ok(offset as u64);
        }
        offset += consumed;
    }
    Ok(offset as u64)
}
