use common::{BlockId, InodeId, PersistenceState, SetAttributeOptions};
use serde::{Deserialize, Serialize};

use crate::inode::Inode;
use crate::mount::MountEntry;

/// One mutation. Payloads carry every id and timestamp the mutation needs,
/// so applying an op is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JournalOp {
    Create(CreateOp),
    Delete(DeleteOp),
    Rename(RenameOp),
    SetAttribute(SetAttributeOp),
    CompleteFile(CompleteFileOp),
    Free(FreeOp),
    NewBlock(NewBlockOp),
    PersistState(PersistStateOp),
    LoadMetadata(LoadMetadataOp),
    Mount(MountOp),
    Unmount(UnmountOp),
}

impl JournalOp {
    pub fn name(&self) -> &'static str {
        match self {
            JournalOp::Create(_) => "create",
            JournalOp::Delete(_) => "delete",
            JournalOp::Rename(_) => "rename",
            JournalOp::SetAttribute(_) => "set-attribute",
            JournalOp::CompleteFile(_) => "complete-file",
            JournalOp::Free(_) => "free",
            JournalOp::NewBlock(_) => "new-block",
            JournalOp::PersistState(_) => "persist-state",
            JournalOp::LoadMetadata(_) => "load-metadata",
            JournalOp::Mount(_) => "mount",
            JournalOp::Unmount(_) => "unmount",
        }
    }
}

/// New inodes for the missing tail of `path`, outermost first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateOp {
    pub path: String,
    pub inodes: Vec<Inode>,
    /// Existing ancestors that become persisted with this create.
    pub persist_ancestors: Vec<InodeId>,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteOp {
    pub path: String,
    pub id: InodeId,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenameOp {
    pub src: String,
    pub dst: String,
    pub id: InodeId,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetAttributeOp {
    pub path: String,
    pub id: InodeId,
    pub options: SetAttributeOptions,
    pub persist_ancestors: Vec<InodeId>,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteFileOp {
    pub path: String,
    pub id: InodeId,
    pub length: u64,
    pub state: PersistenceState,
    pub persist_ancestors: Vec<InodeId>,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FreeOp {
    pub path: String,
    pub id: InodeId,
    /// Files whose cached data is dropped.
    pub files: Vec<InodeId>,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewBlockOp {
    pub path: String,
    pub id: InodeId,
    pub block_id: BlockId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistStateOp {
    pub path: String,
    pub id: InodeId,
    pub state: PersistenceState,
    pub persist_ancestors: Vec<InodeId>,
    pub op_time_ms: i64,
}

/// Entries mirrored from UFS under `path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadMetadataOp {
    pub path: String,
    /// Missing directories leading to and including `path`, outermost first.
    pub ancestors: Vec<Inode>,
    /// New inodes below `path`, parents before children.
    pub children: Vec<Inode>,
    /// Existing directories whose direct children are now loaded.
    pub loaded_dirs: Vec<InodeId>,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MountOp {
    pub entry: MountEntry,
    pub inode: Inode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnmountOp {
    pub path: String,
    pub mount_id: u64,
    /// Inodes dropped with the mount, closed under descent.
    pub removed: Vec<InodeId>,
    /// Inodes kept but no longer backed by UFS.
    pub reset: Vec<InodeId>,
    pub op_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub sequence: u64,
    pub op: JournalOp,
}

/// Full state as of `last_sequence`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub last_sequence: u64,
    pub next_inode_id: InodeId,
    pub next_block_id: BlockId,
    pub inodes: Vec<Inode>,
    /// Mounts other than the root.
    pub mounts: Vec<MountEntry>,
}
