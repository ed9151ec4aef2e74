//! Definitions shared between the namespace master and the gateway that
//! fronts it: identifiers, the file info record and the option set of every
//! operation.
//!
//! Every options struct is `#[serde(default)]`, so a gateway can decode a
//! partial request and get the documented defaults for the missing fields.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type InodeId = u64;
pub type BlockId = u64;

/// Id of the namespace root. The root is its own parent.
pub const ROOT_INODE_ID: InodeId = 0;

pub const DEFAULT_BLOCK_SIZE_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_FILE_MODE: u16 = 0o644;
pub const DEFAULT_DIRECTORY_MODE: u16 = 0o755;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum PersistenceState {
    #[default]
    NotPersisted,
    ToBePersisted,
    Persisted,
}

/// How a file created through the namespace reaches its UFS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PersistType {
    /// Cached only; persisted later on request.
    #[default]
    MustCache,
    /// The client writes through to UFS; completing the file marks it persisted.
    Through,
    /// Completing the file schedules asynchronous persistence.
    AsyncThrough,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TtlAction {
    #[default]
    Delete,
    Free,
}

/// Time-to-live measured from the inode's creation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ttl {
    pub duration_ms: i64,
    pub action: TtlAction,
}

impl Ttl {
    pub fn new(duration_ms: i64, action: TtlAction) -> Self {
        Self {
            duration_ms,
            action,
        }
    }

    pub fn expires_at(&self, creation_time_ms: i64) -> i64 {
        creation_time_ms.saturating_add(self.duration_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TtlSetting {
    Clear,
    Set(Ttl),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LoadMetadataType {
    /// Never consult UFS.
    Never,
    /// Load children of a directory that has never been loaded.
    #[default]
    Once,
    /// Reload children from UFS on every call.
    Always,
}

/// The record returned by `getStatus` and `listStatus`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub file_id: InodeId,
    pub name: String,
    pub path: String,
    pub parent_id: InodeId,
    pub kind: InodeKind,
    pub length: u64,
    pub block_size_bytes: u64,
    pub block_ids: Vec<BlockId>,
    pub completed: bool,
    pub creation_time_ms: i64,
    pub last_modification_time_ms: i64,
    pub last_access_time_ms: i64,
    pub owner: String,
    pub group: String,
    pub mode: u16,
    pub pinned: bool,
    pub ttl: Option<Ttl>,
    pub persistence_state: PersistenceState,
    pub mount_point: bool,
    pub mount_id: u64,
    pub ufs_path: String,
    pub in_memory_percentage: u8,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    pub fn is_persisted(&self) -> bool {
        self.persistence_state == PersistenceState::Persisted
    }

    pub fn modification_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_modification_time_ms)
            .single()
            .unwrap_or_default()
    }

    /// Per-block view used by the legacy `getFileBlockInfoList` call.
    pub fn block_infos(&self) -> Vec<FileBlockInfo> {
        let mut out = Vec::with_capacity(self.block_ids.len());
        let mut offset = 0u64;
        for &block_id in &self.block_ids {
            let remaining = self.length.saturating_sub(offset);
            let length = if self.completed {
                remaining.min(self.block_size_bytes)
            } else {
                self.block_size_bytes
            };
            out.push(FileBlockInfo {
                block_id,
                offset,
                length,
            });
            offset = offset.saturating_add(self.block_size_bytes);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileBlockInfo {
    pub block_id: BlockId,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CreateFileOptions {
    /// Synthesize missing parent directories.
    pub create_ancestors: bool,
    pub allow_exists: bool,
    pub owner: String,
    pub group: String,
    pub mode: u16,
    pub ttl: Option<Ttl>,
    pub block_size_bytes: u64,
    pub persist_type: PersistType,
}

impl Default for CreateFileOptions {
    fn default() -> Self {
        Self {
            create_ancestors: false,
            allow_exists: false,
            owner: String::new(),
            group: String::new(),
            mode: DEFAULT_FILE_MODE,
            ttl: None,
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            persist_type: PersistType::MustCache,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CreateDirectoryOptions {
    pub create_ancestors: bool,
    pub allow_exists: bool,
    pub owner: String,
    pub group: String,
    pub mode: u16,
    pub ttl: Option<Ttl>,
    /// Create the directory (and synthesized ancestors) in UFS as well.
    pub persisted: bool,
}

impl Default for CreateDirectoryOptions {
    fn default() -> Self {
        Self {
            create_ancestors: false,
            allow_exists: false,
            owner: String::new(),
            group: String::new(),
            mode: DEFAULT_DIRECTORY_MODE,
            ttl: None,
            persisted: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CompleteFileOptions {
    pub length: u64,
    /// Length observed in UFS for write-through files.
    pub ufs_length: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FreeOptions {
    pub recursive: bool,
    /// Free pinned files too.
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DeleteOptions {
    pub recursive: bool,
    /// Delete pinned files and files with persistence in flight.
    pub forced: bool,
    /// Leave the UFS side untouched.
    pub metadata_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SetAttributeOptions {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u16>,
    pub pinned: Option<bool>,
    pub ttl: Option<TtlSetting>,
    /// Only `Some(true)` is accepted: the client reports a completed write-through.
    pub persisted: Option<bool>,
    /// Apply owner, group and mode to the whole subtree.
    pub recursive: bool,
}

impl SetAttributeOptions {
    pub fn is_empty(&self) -> bool {
        self.owner.is_none()
            && self.group.is_none()
            && self.mode.is_none()
            && self.pinned.is_none()
            && self.ttl.is_none()
            && self.persisted.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ListStatusOptions {
    pub recursive: bool,
    pub load_metadata: LoadMetadataType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GetStatusOptions {
    pub load_metadata: LoadMetadataType,
}

impl Default for GetStatusOptions {
    fn default() -> Self {
        Self {
            load_metadata: LoadMetadataType::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LoadMetadataOptions {
    pub create_ancestors: bool,
    pub load_direct_children: bool,
    /// Descend into loaded directories.
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CheckConsistencyOptions {
    /// Overrides the configured bound on concurrent UFS calls.
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MountOptions {
    pub read_only: bool,
    pub shared: bool,
    /// Per-mount UFS configuration overrides.
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct UnmountOptions {
    /// Unmount even with pinned entries or persistence in flight.
    pub forced: bool,
    /// Drop namespace-created entries too instead of keeping them unbacked.
    pub drop_created: bool,
}
