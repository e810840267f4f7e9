//! Wire-level message taxonomy.
//!
//! Every type in this module is a hand-written prost message so the schema
//! stays protobuf-compatible on the wire and inside the write-ahead log
//! without a build-time codegen step. `Entry` carries a CRC computed over
//! `(term, index, entry_type, data)`; the WAL validates it on read.

use std::collections::HashMap;

use bytes::Bytes;

/// Event kinds routed through the request channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    Tick = 0,
    Ready = 1,
    Message = 2,
    Proposal = 3,
    Advance = 4,
    Apply = 5,
}

/// Raft message kinds.
///
/// `Hup`, `Propose`, `Lease` and `Nop` are local inputs that share the
/// message taxonomy; the rest travel between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Hup = 0,
    Prevote = 1,
    PrevoteResponse = 2,
    Vote = 3,
    VoteResponse = 4,
    AppendEntriesRequest = 5,
    AppendEntriesResponse = 6,
    SnapshotRequest = 7,
    SnapshotResponse = 8,
    Heartbeat = 9,
    HeartbeatResponse = 10,
    Propose = 11,
    Lease = 12,
    Nop = 13,
}

/// Why a replication or vote request was turned down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RejectType {
    None = 0,
    /// The sender's term is behind the receiver's.
    LowTerm = 1,
    /// `(prev_index, prev_term)` does not match the receiver's log.
    LogNotMatch = 2,
    /// The batch would leave a hole in the receiver's log.
    LogNonSequential = 3,
}

/// Log entry payload kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EntryType {
    Normal = 0,
    Config = 1,
}

/// A single replicated log entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entry {
    #[prost(enumeration = "EntryType", tag = "1")]
    pub entry_type: i32,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub index: u64,
    #[prost(uint32, tag = "4")]
    pub crc: u32,
    #[prost(bytes = "bytes", tag = "5")]
    pub data: Bytes,
    #[prost(map = "string, string", tag = "6")]
    pub attachments: HashMap<String, String>,
}

impl Entry {
    /// Build a checksummed entry.
    pub fn new(entry_type: EntryType, term: u64, index: u64, data: Bytes) -> Self {
        let crc = entry_crc(term, index, entry_type, &data);
        Entry {
            entry_type: entry_type as i32,
            term,
            index,
            crc,
            data,
            attachments: HashMap::new(),
        }
    }

    /// An empty entry appended when a node takes leadership, to commit the
    /// prior terms' suffix under the new term.
    pub fn nop(term: u64, index: u64) -> Self {
        Entry::new(EntryType::Normal, term, index, Bytes::new())
    }

    /// Recompute the checksum and compare with the stored one.
    pub fn validate_crc(&self) -> bool {
        self.crc == entry_crc(self.term, self.index, self.entry_type(), &self.data)
    }
}

/// CRC32 over `(term, index, entry_type, data)`.
pub fn entry_crc(term: u64, index: u64, entry_type: EntryType, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&term.to_le_bytes());
    hasher.update(&index.to_le_bytes());
    hasher.update(&(entry_type as i32).to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Compact state-machine snapshot metadata, ordered by index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct SnapshotMetadata {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
}

/// A snapshot: metadata plus opaque state-machine bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Snapshot {
    #[prost(message, optional, tag = "1")]
    pub meta: Option<SnapshotMetadata>,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

impl Snapshot {
    pub fn new(index: u64, term: u64, data: Bytes) -> Self {
        Snapshot {
            meta: Some(SnapshotMetadata { index, term }),
            data,
        }
    }

    /// Metadata accessor; a snapshot without metadata is never constructed
    /// by this crate and decodes to `(0, 0)`.
    pub fn metadata(&self) -> SnapshotMetadata {
        self.meta.unwrap_or_default()
    }
}

/// Durable election state, persisted before any message that advertises it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct HardState {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// `0` means no vote cast this term; node ids are strictly positive.
    #[prost(uint64, tag = "2")]
    pub vote: u64,
}

/// The envelope exchanged between peers and fed through the raft loop.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub msg_type: i32,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub from: u64,
    #[prost(uint64, tag = "4")]
    pub to: u64,
    /// For appends: `prev_log_index`. For responses: the acknowledged or
    /// conflicting index. For votes: candidate `last_log_index`.
    #[prost(uint64, tag = "5")]
    pub index: u64,
    /// Term paired with `index` (`prev_log_term` / `last_log_term`).
    #[prost(uint64, tag = "6")]
    pub log_term: u64,
    #[prost(message, repeated, tag = "7")]
    pub entries: Vec<Entry>,
    #[prost(message, optional, tag = "8")]
    pub snapshot: Option<Snapshot>,
    #[prost(uint64, tag = "9")]
    pub commit_index: u64,
    #[prost(bool, tag = "10")]
    pub reject: bool,
    #[prost(enumeration = "RejectType", tag = "11")]
    pub reject_type: i32,
    /// Fast-backoff hint accompanying a reject: the highest index the
    /// receiver can accept an append after.
    #[prost(uint64, tag = "12")]
    pub reject_hint: u64,
}

impl Message {
    pub fn new(msg_type: MessageType, from: u64, to: u64, term: u64) -> Self {
        Message {
            msg_type: msg_type as i32,
            from,
            to,
            term,
            ..Default::default()
        }
    }
}
