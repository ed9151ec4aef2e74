//! Inode records held by the tree arena.

use std::collections::BTreeMap;

use common::{
    BlockId, FileInfo, InodeId, InodeKind, PersistType, PersistenceState, ROOT_INODE_ID, Ttl,
};
use serde::{Deserialize, Serialize};

/// Where an inode came from. Unmount drops mirrored entries but keeps the
/// ones the namespace created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InodeOrigin {
    Created,
    Loaded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DirectoryBody {
    pub children: BTreeMap<String, InodeId>,
    pub mount_point: bool,
    /// UFS children are reflected in `children`.
    pub direct_children_loaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileBody {
    pub completed: bool,
    pub length: u64,
    pub block_size_bytes: u64,
    pub block_ids: Vec<BlockId>,
    /// Data is held by the data plane.
    pub cached: bool,
    pub persist_type: PersistType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InodeBody {
    Directory(DirectoryBody),
    File(FileBody),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inode {
    pub id: InodeId,
    pub parent_id: InodeId,
    pub name: String,
    pub creation_time_ms: i64,
    pub last_modification_time_ms: i64,
    /// Moved by journaled changes only; reads leave it alone.
    pub last_access_time_ms: i64,
    pub owner: String,
    pub group: String,
    pub mode: u16,
    pub pinned: bool,
    pub ttl: Option<Ttl>,
    pub persistence_state: PersistenceState,
    pub origin: InodeOrigin,
    pub body: InodeBody,
}

impl Inode {
    pub fn root(owner: &str, now_ms: i64) -> Self {
        Self {
            id: ROOT_INODE_ID,
            parent_id: ROOT_INODE_ID,
            name: String::new(),
            creation_time_ms: now_ms,
            last_modification_time_ms: now_ms,
            last_access_time_ms: now_ms,
            owner: owner.to_string(),
            group: owner.to_string(),
            mode: common::DEFAULT_DIRECTORY_MODE,
            pinned: false,
            ttl: None,
            persistence_state: PersistenceState::Persisted,
            origin: InodeOrigin::Loaded,
            body: InodeBody::Directory(DirectoryBody {
                mount_point: true,
                ..Default::default()
            }),
        }
    }

    pub fn new_directory(id: InodeId, parent_id: InodeId, name: &str, now_ms: i64) -> Self {
        Self {
            id,
            parent_id,
            name: name.to_string(),
            creation_time_ms: now_ms,
            last_modification_time_ms: now_ms,
            last_access_time_ms: now_ms,
            owner: String::new(),
            group: String::new(),
            mode: common::DEFAULT_DIRECTORY_MODE,
            pinned: false,
            ttl: None,
            persistence_state: PersistenceState::NotPersisted,
            origin: InodeOrigin::Created,
            body: InodeBody::Directory(DirectoryBody::default()),
        }
    }

    pub fn new_file(
        id: InodeId,
        parent_id: InodeId,
        name: &str,
        now_ms: i64,
        block_size_bytes: u64,
        persist_type: PersistType,
    ) -> Self {
        Self {
            id,
            parent_id,
            name: name.to_string(),
            creation_time_ms: now_ms,
            last_modification_time_ms: now_ms,
            last_access_time_ms: now_ms,
            owner: String::new(),
            group: String::new(),
            mode: common::DEFAULT_FILE_MODE,
            pinned: false,
            ttl: None,
            persistence_state: PersistenceState::NotPersisted,
            origin: InodeOrigin::Created,
            body: InodeBody::File(FileBody {
                completed: false,
                length: 0,
                block_size_bytes,
                block_ids: Vec::new(),
                cached: false,
                persist_type,
            }),
        }
    }

    /// Stamp a change applied at `op_time_ms`.
    pub fn touch(&mut self, op_time_ms: i64) {
        self.last_modification_time_ms = op_time_ms;
        self.last_access_time_ms = op_time_ms;
    }

    pub fn kind(&self) -> InodeKind {
        match self.body {
            InodeBody::Directory(_) => InodeKind::Directory,
            InodeBody::File(_) => InodeKind::File,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.body, InodeBody::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.body, InodeBody::File(_))
    }

    pub fn is_persisted(&self) -> bool {
        self.persistence_state == PersistenceState::Persisted
    }

    pub fn is_mount_point(&self) -> bool {
        matches!(&self.body, InodeBody::Directory(d) if d.mount_point)
    }

    pub fn as_directory(&self) -> Option<&DirectoryBody> {
        match &self.body {
            InodeBody::Directory(d) => Some(d),
            InodeBody::File(_) => None,
        }
    }

    pub fn as_directory_mut(&mut self) -> Option<&mut DirectoryBody> {
        match &mut self.body {
            InodeBody::Directory(d) => Some(d),
            InodeBody::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileBody> {
        match &self.body {
            InodeBody::File(f) => Some(f),
            InodeBody::Directory(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileBody> {
        match &mut self.body {
            InodeBody::File(f) => Some(f),
            InodeBody::Directory(_) => None,
        }
    }

    pub fn child(&self, name: &str) -> Option<InodeId> {
        self.as_directory()
            .and_then(|d| d.children.get(name).copied())
    }

    pub fn has_children(&self) -> bool {
        self.as_directory().is_some_and(|d| !d.children.is_empty())
    }

    pub fn block_ids(&self) -> &[BlockId] {
        match &self.body {
            InodeBody::File(f) => &f.block_ids,
            InodeBody::Directory(_) => &[],
        }
    }

    pub fn to_file_info(&self, path: String, mount_id: u64, ufs_path: String) -> FileInfo {
        let (length, block_size_bytes, block_ids, completed, in_memory) = match &self.body {
            InodeBody::File(f) => (
                f.length,
                f.block_size_bytes,
                f.block_ids.clone(),
                f.completed,
                if f.cached { 100 } else { 0 },
            ),
            InodeBody::Directory(_) => (0, 0, Vec::new(), true, 0),
        };
        FileInfo {
            file_id: self.id,
            name: self.name.clone(),
            path,
            parent_id: self.parent_id,
            kind: self.kind(),
            length,
            block_size_bytes,
            block_ids,
            completed,
            creation_time_ms: self.creation_time_ms,
            last_modification_time_ms: self.last_modification_time_ms,
            last_access_time_ms: self.last_access_time_ms,
            owner: self.owner.clone(),
            group: self.group.clone(),
            mode: self.mode,
            pinned: self.pinned,
            ttl: self.ttl,
            persistence_state: self.persistence_state,
            mount_point: self.is_mount_point(),
            mount_id,
            ufs_path,
            in_memory_percentage: in_memory,
        }
    }
}
