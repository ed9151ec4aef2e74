//! Application of journal entries to locked inodes, shared by live
//! mutations and replay.

use std::collections::HashSet;

use common::{InodeId, PersistenceState, SetAttributeOptions, TtlSetting};

use crate::error::{MasterError, Result};
use crate::inode::{Inode, InodeOrigin};
use crate::journal::{
    CompleteFileOp, CreateOp, DeleteOp, FreeOp, JournalOp, LoadMetadataOp, MountOp, NewBlockOp,
    PersistStateOp, RenameOp, SetAttributeOp, UnmountOp,
};
use crate::lock::{LockPattern, LockedPair, LockedPath, SubtreeEntry};
use crate::path::NsPath;

use super::NamespaceMaster;

/// Depth of the shallowest inode on `locked` whose id is in `ids`.
pub(crate) fn depth_of_ids(locked: &LockedPath, ids: &[InodeId]) -> Option<usize> {
    if ids.is_empty() {
        return None;
    }
    locked.inodes().position(|i| ids.contains(&i.id))
}

/// Not-persisted ancestors between the enclosing mount point and the
/// target (or the deepest existing inode when the target is missing).
pub(crate) fn unpersisted_ancestors(locked: &LockedPath) -> Vec<(usize, InodeId)> {
    let Some(limit) = locked.path().depth().checked_sub(1) else {
        return Vec::new();
    };
    let limit = limit.min(locked.existing_depth());
    let mount_depth = (0..=limit)
        .rev()
        .find(|&d| locked.inode(d).is_some_and(Inode::is_mount_point))
        .unwrap_or(0);
    (mount_depth + 1..=limit)
        .filter_map(|d| locked.inode(d).map(|i| (d, i)))
        .filter(|(_, i)| !i.is_persisted())
        .map(|(d, i)| (d, i.id))
        .collect()
}

/// Whether setting `options` on a directory touches its descendants.
pub(crate) fn wants_subtree(options: &SetAttributeOptions) -> bool {
    options.pinned.is_some()
        || (options.recursive
            && (options.owner.is_some() || options.group.is_some() || options.mode.is_some()))
}

fn mismatch(path: &str, what: impl std::fmt::Display) -> MasterError {
    MasterError::Internal(format!("{path}: {what}"))
}

fn check_id(inode: &Inode, id: InodeId, path: &str) -> Result<()> {
    if inode.id != id {
        return Err(mismatch(
            path,
            format_args!("expected inode {id}, found {}", inode.id),
        ));
    }
    Ok(())
}

fn mark_persisted(locked: &mut LockedPath, ids: &[InodeId]) -> Result<()> {
    for depth in 0..=locked.existing_depth() {
        let hit = locked.inode(depth).is_some_and(|i| ids.contains(&i.id));
        if hit {
            locked.inode_mut(depth)?.persistence_state = PersistenceState::Persisted;
        }
    }
    Ok(())
}

fn set_attributes(inode: &mut Inode, options: &SetAttributeOptions, is_target: bool) {
    if is_target || options.recursive {
        if let Some(owner) = &options.owner {
            inode.owner = owner.clone();
        }
        if let Some(group) = &options.group {
            inode.group = group.clone();
        }
        if let Some(mode) = options.mode {
            inode.mode = mode;
        }
    }
    if let Some(pinned) = options.pinned {
        inode.pinned = pinned;
    }
    if !is_target {
        return;
    }
    match options.ttl {
        Some(TtlSetting::Set(ttl)) => inode.ttl = Some(ttl),
        Some(TtlSetting::Clear) => inode.ttl = None,
        None => {}
    }
    if options.persisted == Some(true) {
        inode.persistence_state = PersistenceState::Persisted;
    }
}

/// Forget the UFS backing of an entry kept across an unmount.
fn detach_from_ufs(inode: &mut Inode) {
    inode.persistence_state = PersistenceState::NotPersisted;
    inode.origin = InodeOrigin::Created;
    if let Some(dir) = inode.as_directory_mut() {
        dir.mount_point = false;
        dir.direct_children_loaded = false;
    }
}

impl NamespaceMaster {
    pub(crate) async fn lock_subtree(
        &self,
        locked: &LockedPath,
        write: bool,
    ) -> Result<Vec<SubtreeEntry>> {
        let target = locked.target()?;
        if !target.is_directory() {
            return Ok(Vec::new());
        }
        self.tree.lock_descendants(target, write).await
    }

    /// Re-acquire the locks `op` was applied under and apply it again.
    pub(crate) async fn replay(&self, op: &JournalOp) -> Result<()> {
        match op {
            JournalOp::Create(op) => {
                let path = NsPath::new(&op.path)?;
                let from = path.depth().saturating_sub(1);
                let mut locked = self
                    .lock_widening(&path, from, true, |l| depth_of_ids(l, &op.persist_ancestors))
                    .await?;
                self.apply_create(&mut locked, op).await
            }
            JournalOp::Delete(op) => {
                let path = NsPath::new(&op.path)?;
                let mut locked = self.tree.lock_path(&path, LockPattern::WriteParent).await?;
                self.apply_delete(&mut locked, op).await.map(|_| ())
            }
            JournalOp::Rename(op) => {
                let src = NsPath::new(&op.src)?;
                let dst = NsPath::new(&op.dst)?;
                let mut pair = self.tree.lock_pair(&src, &dst).await?;
                self.apply_rename(&mut pair, op)
            }
            JournalOp::SetAttribute(op) => {
                let path = NsPath::new(&op.path)?;
                let mut locked = self
                    .lock_widening(&path, path.depth(), false, |l| {
                        depth_of_ids(l, &op.persist_ancestors)
                    })
                    .await?;
                let mut subtree = if wants_subtree(&op.options) {
                    self.lock_subtree(&locked, true).await?
                } else {
                    Vec::new()
                };
                self.apply_set_attribute(&mut locked, &mut subtree, op)
            }
            JournalOp::CompleteFile(op) => {
                let path = NsPath::new(&op.path)?;
                let mut locked = self
                    .lock_widening(&path, path.depth(), false, |l| {
                        depth_of_ids(l, &op.persist_ancestors)
                    })
                    .await?;
                self.apply_complete_file(&mut locked, op)
            }
            JournalOp::Free(op) => {
                let path = NsPath::new(&op.path)?;
                let mut locked = self.tree.lock_path(&path, LockPattern::WriteInode).await?;
                let mut subtree = self.lock_subtree(&locked, true).await?;
                self.apply_free(&mut locked, &mut subtree, op)
            }
            JournalOp::NewBlock(op) => {
                let path = NsPath::new(&op.path)?;
                let mut locked = self.tree.lock_path(&path, LockPattern::WriteInode).await?;
                self.apply_new_block(&mut locked, op)
            }
            JournalOp::PersistState(op) => {
                let path = NsPath::new(&op.path)?;
                let mut locked = self
                    .lock_widening(&path, path.depth(), false, |l| {
                        depth_of_ids(l, &op.persist_ancestors)
                    })
                    .await?;
                self.apply_persist_state(&mut locked, op)
            }
            JournalOp::LoadMetadata(op) => {
                let path = NsPath::new(&op.path)?;
                if op.ancestors.is_empty() {
                    let mut locked = self.tree.lock_path(&path, LockPattern::WriteInode).await?;
                    let mut subtree = self.lock_subtree(&locked, true).await?;
                    self.apply_load_metadata(&mut locked, &mut subtree, op).await
                } else {
                    let mut locked = self.tree.lock_for_create(&path).await?;
                    self.apply_load_metadata(&mut locked, &mut [], op).await
                }
            }
            JournalOp::Mount(op) => {
                let path = NsPath::new(&op.entry.path)?;
                let mut locked = self.tree.lock_for_create(&path).await?;
                self.apply_mount(&mut locked, op).await
            }
            JournalOp::Unmount(op) => {
                let path = NsPath::new(&op.path)?;
                let mut locked = self.tree.lock_path(&path, LockPattern::WriteParent).await?;
                let mut subtree = self.lock_subtree(&locked, true).await?;
                self.apply_unmount(&mut locked, &mut subtree, op).await
            }
        }
    }

    pub(crate) async fn apply_create(&self, locked: &mut LockedPath, op: &CreateOp) -> Result<()> {
        if locked.existing_depth() + op.inodes.len() != locked.path().depth() {
            return Err(mismatch(&op.path, "create does not fit the resolved path"));
        }
        mark_persisted(locked, &op.persist_ancestors)?;
        self.tree
            .add_chain(locked, op.inodes.clone(), op.op_time_ms)
            .await
    }

    /// Returns the removed inodes.
    pub(crate) async fn apply_delete(
        &self,
        locked: &mut LockedPath,
        op: &DeleteOp,
    ) -> Result<Vec<Inode>> {
        check_id(locked.target()?, op.id, &op.path)?;
        self.tree.remove_subtree(locked, op.op_time_ms).await
    }

    pub(crate) fn apply_rename(&self, pair: &mut LockedPair, op: &RenameOp) -> Result<()> {
        let src = pair
            .src_target()
            .ok_or_else(|| MasterError::PathNotFound(op.src.clone()))?;
        check_id(src, op.id, &op.src)?;
        if pair.dst_target().is_some() {
            return Err(MasterError::AlreadyExists(op.dst.clone()));
        }
        self.tree.move_inode(pair, op.op_time_ms)
    }

    pub(crate) fn apply_set_attribute(
        &self,
        locked: &mut LockedPath,
        subtree: &mut [SubtreeEntry],
        op: &SetAttributeOp,
    ) -> Result<()> {
        mark_persisted(locked, &op.persist_ancestors)?;
        let target = locked.target_mut()?;
        check_id(target, op.id, &op.path)?;
        set_attributes(target, &op.options, true);
        target.touch(op.op_time_ms);
        for entry in subtree.iter_mut() {
            set_attributes(entry.inode.get_mut()?, &op.options, false);
        }
        Ok(())
    }

    pub(crate) fn apply_complete_file(
        &self,
        locked: &mut LockedPath,
        op: &CompleteFileOp,
    ) -> Result<()> {
        mark_persisted(locked, &op.persist_ancestors)?;
        let target = locked.target_mut()?;
        check_id(target, op.id, &op.path)?;
        target.persistence_state = op.state;
        target.touch(op.op_time_ms);
        let file = target
            .as_file_mut()
            .ok_or_else(|| MasterError::IsADirectory(op.path.clone()))?;
        file.completed = true;
        file.length = op.length;
        file.cached = true;
        Ok(())
    }

    pub(crate) fn apply_free(
        &self,
        locked: &mut LockedPath,
        subtree: &mut [SubtreeEntry],
        op: &FreeOp,
    ) -> Result<()> {
        let target = locked.target_mut()?;
        check_id(target, op.id, &op.path)?;
        let mut inodes: Vec<&mut Inode> = vec![target];
        for entry in subtree.iter_mut() {
            if op.files.contains(&entry.inode.id) {
                inodes.push(entry.inode.get_mut()?);
            }
        }
        for inode in inodes {
            if !op.files.contains(&inode.id) {
                continue;
            }
            if let Some(file) = inode.as_file_mut() {
                file.cached = false;
            }
        }
        Ok(())
    }

    pub(crate) fn apply_new_block(&self, locked: &mut LockedPath, op: &NewBlockOp) -> Result<()> {
        let target = locked.target_mut()?;
        check_id(target, op.id, &op.path)?;
        let file = target
            .as_file_mut()
            .ok_or_else(|| MasterError::IsADirectory(op.path.clone()))?;
        file.block_ids.push(op.block_id);
        self.blocks.observe(op.block_id);
        Ok(())
    }

    pub(crate) fn apply_persist_state(
        &self,
        locked: &mut LockedPath,
        op: &PersistStateOp,
    ) -> Result<()> {
        mark_persisted(locked, &op.persist_ancestors)?;
        let target = locked.target_mut()?;
        check_id(target, op.id, &op.path)?;
        target.persistence_state = op.state;
        Ok(())
    }

    pub(crate) async fn apply_load_metadata(
        &self,
        locked: &mut LockedPath,
        subtree: &mut [SubtreeEntry],
        op: &LoadMetadataOp,
    ) -> Result<()> {
        let mut parents: Vec<&mut Inode> = vec![locked.deepest_mut()?];
        for entry in subtree.iter_mut() {
            if entry.inode.is_directory() {
                parents.push(entry.inode.get_mut()?);
            }
        }
        for parent in parents.iter_mut() {
            if op.loaded_dirs.contains(&parent.id) {
                if let Some(dir) = parent.as_directory_mut() {
                    dir.direct_children_loaded = true;
                }
            }
        }
        let mut new = op.ancestors.clone();
        new.extend(op.children.iter().cloned());
        self.tree.attach(&mut parents, new, op.op_time_ms).await
    }

    pub(crate) async fn apply_mount(&self, locked: &mut LockedPath, op: &MountOp) -> Result<()> {
        let ufs = self
            .ufs_factory
            .create(&op.entry.ufs_uri, &op.entry.options.properties)
            .map_err(|e| MasterError::ufs(op.entry.ufs_uri.clone(), e))?;
        if locked.is_full() {
            return Err(MasterError::AlreadyExists(op.entry.path.clone()));
        }
        self.tree
            .add_chain(locked, vec![op.inode.clone()], op.inode.creation_time_ms)
            .await?;
        self.mounts.add(op.entry.clone(), ufs).await
    }

    pub(crate) async fn apply_unmount(
        &self,
        locked: &mut LockedPath,
        subtree: &mut [SubtreeEntry],
        op: &UnmountOp,
    ) -> Result<()> {
        let removed: HashSet<InodeId> = op.removed.iter().copied().collect();
        for entry in subtree.iter_mut() {
            if op.reset.contains(&entry.inode.id) {
                detach_from_ufs(entry.inode.get_mut()?);
            }
        }
        let (target_id, target_name) = {
            let target = locked.target_mut()?;
            if !target.is_mount_point() {
                return Err(mismatch(&op.path, "not a mount point"));
            }
            if op.reset.contains(&target.id) {
                detach_from_ufs(target);
            }
            self.tree.remove_ids(subtree, target, &removed).await?;
            (target.id, target.name.clone())
        };
        if removed.contains(&target_id) {
            let parent = locked.parent_mut()?;
            if let Some(dir) = parent.as_directory_mut() {
                dir.children.remove(&target_name);
            }
            parent.touch(op.op_time_ms);
        }
        let path = NsPath::new(&op.path)?;
        self.mounts.remove(&path).await?;
        Ok(())
    }
}
