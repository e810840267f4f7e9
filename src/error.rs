//! Error taxonomy.
//!
//! Configuration errors are fatal at construction. Replication rejections
//! travel on the wire (`RejectType`) and are not errors here. Storage
//! failures reject the in-flight batch and are retried by the raft loop;
//! they only become [`Fatal`] during startup.

use anyerror::AnyError;

use crate::NodeId;

/// Errors surfaced while validating a [`Config`](crate::Config).
#[derive(Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum ConfigError {
    #[error("node id must be positive, got {id}")]
    NonPositiveId { id: u64 },

    #[error("unique id required, duplicate node id: {id}")]
    DuplicateId { id: NodeId },

    #[error("node {id} is not a member of the configured cluster")]
    NotInCluster { id: NodeId },

    #[error("invalid cluster member {invalid:?}, expect: 'id@host:port'")]
    InvalidMember { invalid: String },

    #[error("election timeout: min({min}) must be <= max({max}) ticks, both > 0")]
    ElectionTimeout { min: u64, max: u64 },

    #[error("heartbeat interval must be > 0 ticks")]
    HeartbeatIsZero,

    #[error("min snapshots retention must be above 0")]
    RetentionIsZero,

    #[error("ring buffer size must be > 0 for combination storage")]
    RingBufferIsZero,
}

/// Errors from the write-ahead log, the snapshot store and the in-memory
/// log view.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {source} while {context}")]
    Io { source: AnyError, context: String },

    #[error("corrupt record at index {index}: {reason}")]
    Corrupt { index: u64, reason: String },

    #[error("non-sequential append: expect index {expect}, got {got}")]
    NonSequential { expect: u64, got: u64 },

    #[error("term regression at committed index {index}: {existing} -> {incoming}")]
    TermRegression {
        index: u64,
        existing: u64,
        incoming: u64,
    },

    #[error("refuse to truncate at {index}: committed index is {committed}")]
    TruncateCommitted { index: u64, committed: u64 },

    #[error("index {index} out of range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("snapshot {index} not found")]
    SnapshotNotFound { index: u64 },
}

impl StorageError {
    pub fn io(context: impl ToString, err: std::io::Error) -> Self {
        StorageError::Io {
            source: AnyError::new(&err),
            context: context.to_string(),
        }
    }
}

/// Why a proposal was not accepted.
#[derive(Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum ProposeError {
    /// This node is not the leader; redirect to `leader` when known.
    #[error("not leader, current leader: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    /// Fewer than a quorum of peers are reachable, or the engine is
    /// shutting down.
    #[error("group unavailable")]
    Unavailable,

    /// The entry was overwritten by a competing leader before it
    /// committed.
    #[error("proposal at index {index} superseded by term {term}")]
    Superseded { index: u64, term: u64 },
}

/// Unrecoverable startup failures.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("state machine is required")]
    MissingStateMachine,
}
