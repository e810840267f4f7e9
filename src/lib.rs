//! An embeddable Raft consensus engine core.
//!
//! raftling drives a replicated log through three cooperating
//! single-threaded event loops — a raft loop, a group-commit loop and an
//! apply loop — connected by a typed request channel and paced by a
//! logical clock. The embedding supplies a [`StateMachine`] to apply
//! committed entries to and a [`Transporter`] to move [`Message`]s
//! between peers; everything else (elections with pre-vote and leader
//! lease, log matching, quorum commitment, group commit, snapshot
//! install and compaction) lives here.
//!
//! ```ignore
//! let config = Config {
//!     id: 1,
//!     cluster: "1@127.0.0.1:9001".to_string(),
//!     ..Default::default()
//! };
//! let raft = Raft::spawn(config, state_machine, transporter).await?;
//! raft.propose("hello").await?;
//! ```

mod channel;
mod core;
mod engine;
mod state;

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod metrics;
pub mod network;
pub mod node;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod testing;
pub mod wal;

mod raft;

/// Cluster member identifier; strictly positive.
pub type NodeId = u64;

pub use config::Config;
pub use config::StorageType;
pub use error::ConfigError;
pub use error::Fatal;
pub use error::ProposeError;
pub use error::StorageError;
pub use message::Entry;
pub use message::EntryType;
pub use message::EventType;
pub use message::HardState;
pub use message::Message;
pub use message::MessageType;
pub use message::RejectType;
pub use message::Snapshot;
pub use message::SnapshotMetadata;
pub use metrics::RaftMetrics;
pub use metrics::Wait;
pub use metrics::WaitError;
pub use network::Transporter;
pub use node::GroupState;
pub use node::NodeInfo;
pub use node::ReplayState;
pub use raft::Raft;
pub use snapshot::Snapshotter;
pub use state::Status;
pub use state_machine::StateMachine;
