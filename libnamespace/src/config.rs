use std::path::PathBuf;

use common::{DEFAULT_BLOCK_SIZE_BYTES, MountOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MasterConfig {
    /// Log segments and the checkpoint live here.
    pub journal_dir: PathBuf,
    /// UFS location mounted at `/`.
    pub root_ufs: String,
    pub root_mount: MountOptions,
    pub journal: JournalConfig,
    pub persistence: PersistenceConfig,
    pub consistency: ConsistencyConfig,
    pub ttl_check_interval_secs: u64,
    /// Used for files created with a block size of zero.
    pub default_block_size_bytes: u64,
    /// Cached file content served to the persistence workers.
    pub cache_dir: PathBuf,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            journal_dir: PathBuf::from("/var/lib/nsmaster/journal"),
            root_ufs: "/var/lib/nsmaster/ufs".to_string(),
            root_mount: MountOptions::default(),
            journal: JournalConfig::default(),
            persistence: PersistenceConfig::default(),
            consistency: ConsistencyConfig::default(),
            ttl_check_interval_secs: 60,
            default_block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            cache_dir: PathBuf::from("/var/lib/nsmaster/cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    /// Checkpoint after this many entries.
    pub checkpoint_entries: u64,
    pub checkpoint_interval_secs: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            checkpoint_entries: 10_000,
            checkpoint_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Concurrent UFS calls per check.
    pub max_concurrency: usize,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
        }
    }
}
