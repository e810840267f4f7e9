//! Engine runtime configuration.

use std::path::PathBuf;

use clap::Parser;
use rand::Rng;

use crate::error::ConfigError;
use crate::NodeId;

/// Which backend serves log reads behind the write-ahead log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageType {
    /// Serve every read from the WAL-backed store.
    Disk,
    /// Keep every live entry in memory; the WAL is durability only.
    Memory,
    /// A bounded in-memory ring in front of the WAL; cold reads fall
    /// through to disk.
    Combination,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Disk => write!(f, "disk"),
            StorageType::Memory => write!(f, "memory"),
            StorageType::Combination => write!(f, "combination"),
        }
    }
}

/// Runtime configuration for a raftling node.
///
/// Construct with struct update syntax or parse from command-line style
/// arguments, then call [`Config::validate`] before handing it to
/// [`Raft::spawn`](crate::Raft::spawn):
///
/// ```ignore
/// let config = Config {
///     id: 1,
///     cluster: "1@127.0.0.1:9001,2@127.0.0.1:9002,3@127.0.0.1:9003".to_string(),
///     ..Default::default()
/// }
/// .validate()?;
/// ```
#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// This node's id. Must be positive and listed in `cluster`.
    #[clap(long, default_value = "1")]
    pub id: NodeId,

    /// Comma-separated cluster members, each `id@host:port`.
    #[clap(long, default_value = "1@127.0.0.1:9001")]
    pub cluster: String,

    /// Directory holding the WAL segments and snapshots.
    #[clap(long, default_value = "./raftling")]
    pub data_dir: String,

    /// Log read backend.
    #[clap(long, value_enum, default_value_t = StorageType::Memory)]
    pub storage_type: StorageType,

    /// Ring capacity (entries) for `combination` storage.
    #[clap(long, default_value = "4096")]
    pub ring_buffer_size: usize,

    /// Logical clock resolution in milliseconds.
    #[clap(long, default_value = "100")]
    pub tick_interval_ms: u64,

    /// Lower bound of the randomized election timeout, in ticks.
    #[clap(long, default_value = "10")]
    pub election_tick_min: u64,

    /// Upper bound of the randomized election timeout, in ticks.
    #[clap(long, default_value = "20")]
    pub election_tick_max: u64,

    /// Leader heartbeat interval, in ticks.
    #[clap(long, default_value = "2")]
    pub heartbeat_tick: u64,

    /// Leader lease check interval, in ticks.
    #[clap(long, default_value = "10")]
    pub lease_tick: u64,

    /// Hand snapshot bytes to the state machine without copying.
    #[clap(long, default_value_t = true)]
    pub snapshot_read_only: bool,

    /// How many most recent snapshots the retention sweep keeps. Must be
    /// above 0.
    #[clap(long, default_value = "3")]
    pub min_snapshots_retention: usize,

    /// Bounded wait of the apply loop, which doubles as the snapshot
    /// trigger check interval.
    #[clap(long, default_value = "5")]
    pub snapshot_trigger_check_interval_seconds: u64,

    /// Applied entries since the last snapshot before a build is
    /// triggered.
    #[clap(long, default_value = "10000")]
    pub snapshot_trigger_threshold: u64,

    /// Concurrent background snapshot builds allowed.
    #[clap(long, default_value = "2")]
    pub background_threads_num: usize,

    /// Cap on entries carried by one append message.
    #[clap(long, default_value = "256")]
    pub max_transport_entries: u64,

    /// Roll the active WAL segment past this size.
    #[clap(long, default_value = "67108864")]
    pub wal_segment_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// Build a `Config` from command-line style arguments.
    pub fn build(args: &[&str]) -> Result<Config, ConfigError> {
        let config = <Self as Parser>::parse_from(args);
        config.validate()
    }

    /// Validate and return this config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.id == 0 {
            return Err(ConfigError::NonPositiveId { id: self.id });
        }

        if self.election_tick_min == 0 || self.election_tick_min > self.election_tick_max {
            return Err(ConfigError::ElectionTimeout {
                min: self.election_tick_min,
                max: self.election_tick_max,
            });
        }

        if self.heartbeat_tick == 0 {
            return Err(ConfigError::HeartbeatIsZero);
        }

        if self.min_snapshots_retention == 0 {
            return Err(ConfigError::RetentionIsZero);
        }

        if self.storage_type == StorageType::Combination && self.ring_buffer_size == 0 {
            return Err(ConfigError::RingBufferIsZero);
        }

        let members = self.parse_cluster()?;
        if !members.iter().any(|(id, _)| *id == self.id) {
            return Err(ConfigError::NotInCluster { id: self.id });
        }

        Ok(self)
    }

    /// Parse the `cluster` string into `(id, address)` pairs, checking id
    /// uniqueness and positivity.
    pub fn parse_cluster(&self) -> Result<Vec<(NodeId, String)>, ConfigError> {
        let mut members = Vec::new();
        for part in self.cluster.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (id, addr) = part.split_once('@').ok_or_else(|| ConfigError::InvalidMember {
                invalid: part.to_string(),
            })?;
            let id: NodeId = id.parse().map_err(|_| ConfigError::InvalidMember {
                invalid: part.to_string(),
            })?;
            if id == 0 {
                return Err(ConfigError::NonPositiveId { id });
            }
            if members.iter().any(|(existing, _)| *existing == id) {
                return Err(ConfigError::DuplicateId { id });
            }
            members.push((id, addr.to_string()));
        }

        if members.is_empty() {
            return Err(ConfigError::InvalidMember {
                invalid: self.cluster.clone(),
            });
        }

        Ok(members)
    }

    /// A fresh election timeout drawn from the configured range.
    pub fn new_rand_election_tick(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_tick_min..=self.election_tick_max)
    }

    pub fn wal_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("wal")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("snapshot")
    }
}
