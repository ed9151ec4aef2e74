//! Guards produced by hierarchical path locking.
//!
//! A locked path holds one guard per resolved inode, root first. Guards are
//! owned so they can outlive the arena lookup that produced them, and they
//! are released in reverse order when the value is dropped.

use std::ops::Deref;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::error::{MasterError, Result};
use crate::inode::Inode;
use crate::path::NsPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPattern {
    /// Every inode on the path in read mode.
    Read,
    /// Ancestors read, target write.
    WriteInode,
    /// Ancestors read, parent and target write.
    WriteParent,
}

impl LockPattern {
    pub(crate) fn write_at(self, depth: usize, path_depth: usize) -> bool {
        match self {
            LockPattern::Read => false,
            LockPattern::WriteInode => depth == path_depth,
            LockPattern::WriteParent => depth + 1 >= path_depth,
        }
    }
}

pub enum LockedInode {
    Read(OwnedRwLockReadGuard<Inode>),
    Write(OwnedRwLockWriteGuard<Inode>),
}

impl LockedInode {
    pub fn is_write(&self) -> bool {
        matches!(self, LockedInode::Write(_))
    }

    pub fn get_mut(&mut self) -> Result<&mut Inode> {
        match self {
            LockedInode::Write(g) => Ok(&mut **g),
            LockedInode::Read(g) => Err(MasterError::Internal(format!(
                "inode {} is not write locked",
                g.id
            ))),
        }
    }
}

impl Deref for LockedInode {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        match self {
            LockedInode::Read(g) => g,
            LockedInode::Write(g) => g,
        }
    }
}

pub struct LockedPath {
    path: NsPath,
    // index is depth; shorter than depth + 1 when the path is not fully resolved
    inodes: Vec<LockedInode>,
}

impl LockedPath {
    pub(crate) fn new(path: NsPath, inodes: Vec<LockedInode>) -> Self {
        Self { path, inodes }
    }

    pub fn path(&self) -> &NsPath {
        &self.path
    }

    pub fn is_full(&self) -> bool {
        self.inodes.len() == self.path.depth() + 1
    }

    /// Depth of the deepest resolved inode.
    pub fn existing_depth(&self) -> usize {
        self.inodes.len().saturating_sub(1)
    }

    pub fn deepest(&self) -> &Inode {
        // the root is always resolved
        &self.inodes[self.inodes.len() - 1]
    }

    pub fn deepest_mut(&mut self) -> Result<&mut Inode> {
        let last = self.inodes.len() - 1;
        self.inodes[last].get_mut()
    }

    pub fn deepest_is_write(&self) -> bool {
        self.inodes.last().is_some_and(LockedInode::is_write)
    }

    pub fn target(&self) -> Result<&Inode> {
        if !self.is_full() {
            return Err(MasterError::PathNotFound(self.path.to_string()));
        }
        Ok(self.deepest())
    }

    pub fn target_mut(&mut self) -> Result<&mut Inode> {
        if !self.is_full() {
            return Err(MasterError::PathNotFound(self.path.to_string()));
        }
        self.deepest_mut()
    }

    pub fn exists(&self) -> bool {
        self.is_full()
    }

    pub fn parent(&self) -> Option<&Inode> {
        let depth = self.path.depth().checked_sub(1)?;
        self.inodes.get(depth).map(|g| &**g)
    }

    pub fn parent_mut(&mut self) -> Result<&mut Inode> {
        let depth = self
            .path
            .depth()
            .checked_sub(1)
            .ok_or_else(|| MasterError::invalid_path("/", "the root has no parent"))?;
        let path = self.path.to_string();
        self.inodes
            .get_mut(depth)
            .ok_or(MasterError::PathNotFound(path))?
            .get_mut()
    }

    pub fn inode(&self, depth: usize) -> Option<&Inode> {
        self.inodes.get(depth).map(|g| &**g)
    }

    pub fn inode_mut(&mut self, depth: usize) -> Result<&mut Inode> {
        let path = self.path.ancestor(depth).to_string();
        self.inodes
            .get_mut(depth)
            .ok_or(MasterError::PathNotFound(path))?
            .get_mut()
    }

    pub fn is_write_at(&self, depth: usize) -> bool {
        self.inodes.get(depth).is_some_and(LockedInode::is_write)
    }

    pub fn inodes(&self) -> impl Iterator<Item = &Inode> {
        self.inodes.iter().map(|g| &**g)
    }

    /// Segments that did not resolve.
    pub fn missing_segments(&self) -> &[String] {
        &self.path.segments()[self.inodes.len() - 1..]
    }
}

/// Two paths locked together for rename. The shared prefix is locked once,
/// then each branch in path order.
pub struct LockedPair {
    src: NsPath,
    dst: NsPath,
    shared: Vec<LockedInode>,
    src_branch: Vec<LockedInode>,
    dst_branch: Vec<LockedInode>,
}

impl LockedPair {
    pub(crate) fn new(
        src: NsPath,
        dst: NsPath,
        shared: Vec<LockedInode>,
        src_branch: Vec<LockedInode>,
        dst_branch: Vec<LockedInode>,
    ) -> Self {
        Self {
            src,
            dst,
            shared,
            src_branch,
            dst_branch,
        }
    }

    pub fn src(&self) -> &NsPath {
        &self.src
    }

    pub fn dst(&self) -> &NsPath {
        &self.dst
    }

    fn split(&self) -> usize {
        self.shared.len()
    }

    fn src_slot(&self, depth: usize) -> Option<&LockedInode> {
        if depth < self.split() {
            self.shared.get(depth)
        } else {
            self.src_branch.get(depth - self.split())
        }
    }

    fn dst_slot(&self, depth: usize) -> Option<&LockedInode> {
        if depth < self.split() {
            self.shared.get(depth)
        } else {
            self.dst_branch.get(depth - self.split())
        }
    }

    fn src_slot_mut(&mut self, depth: usize) -> Option<&mut LockedInode> {
        let split = self.split();
        if depth < split {
            self.shared.get_mut(depth)
        } else {
            self.src_branch.get_mut(depth - split)
        }
    }

    fn dst_slot_mut(&mut self, depth: usize) -> Option<&mut LockedInode> {
        let split = self.split();
        if depth < split {
            self.shared.get_mut(depth)
        } else {
            self.dst_branch.get_mut(depth - split)
        }
    }

    pub fn src_inodes(&self) -> impl Iterator<Item = &Inode> {
        (0..=self.src.depth()).map_while(|d| self.src_slot(d).map(|g| &**g))
    }

    pub fn src_target(&self) -> Option<&Inode> {
        self.src_slot(self.src.depth()).map(|g| &**g)
    }

    pub fn src_parent(&self) -> Option<&Inode> {
        self.src_slot(self.src.depth().checked_sub(1)?).map(|g| &**g)
    }

    pub fn dst_target(&self) -> Option<&Inode> {
        self.dst_slot(self.dst.depth()).map(|g| &**g)
    }

    pub fn dst_parent(&self) -> Option<&Inode> {
        self.dst_slot(self.dst.depth().checked_sub(1)?).map(|g| &**g)
    }

    pub fn src_target_mut(&mut self) -> Result<&mut Inode> {
        let depth = self.src.depth();
        let path = self.src.to_string();
        self.src_slot_mut(depth)
            .ok_or(MasterError::PathNotFound(path))?
            .get_mut()
    }

    pub fn src_parent_mut(&mut self) -> Result<&mut Inode> {
        let depth = self.src.depth().saturating_sub(1);
        let path = self.src.to_string();
        self.src_slot_mut(depth)
            .ok_or(MasterError::PathNotFound(path))?
            .get_mut()
    }

    pub fn dst_parent_mut(&mut self) -> Result<&mut Inode> {
        let depth = self.dst.depth().saturating_sub(1);
        let path = self.dst.to_string();
        self.dst_slot_mut(depth)
            .ok_or(MasterError::PathNotFound(path))?
            .get_mut()
    }
}

/// A descendant locked below a held path, with its segments relative to it.
pub struct SubtreeEntry {
    pub relative: Vec<String>,
    pub inode: LockedInode,
}

impl SubtreeEntry {
    pub fn path_under(&self, base: &NsPath) -> NsPath {
        let mut path = base.clone();
        for seg in &self.relative {
            // segments come from existing child names
            if let Ok(p) = path.join(seg) {
                path = p;
            }
        }
        path
    }
}
