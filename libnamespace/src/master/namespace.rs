use std::io;

use log::{debug, warn};

use common::{
    BlockId, CompleteFileOptions, CreateDirectoryOptions, CreateFileOptions, DEFAULT_DIRECTORY_MODE,
    DeleteOptions, FileBlockInfo, FileInfo, FreeOptions, GetStatusOptions, InodeId,
    ListStatusOptions, LoadMetadataOptions, LoadMetadataType, PersistType, PersistenceState,
    ROOT_INODE_ID, SetAttributeOptions, Ttl,
};

use crate::error::{MasterError, Result};
use crate::inode::Inode;
use crate::journal::{
    CompleteFileOp, CreateOp, DeleteOp, FreeOp, JournalOp, NewBlockOp, PersistStateOp, RenameOp,
    SetAttributeOp,
};
use crate::lock::{LockPattern, LockedPath};
use crate::path::NsPath;

use super::apply::{unpersisted_ancestors, wants_subtree};
use super::{NamespaceMaster, now_ms};

fn first_depth(found: Vec<(usize, InodeId)>) -> Option<usize> {
    found.first().map(|(d, _)| *d)
}

fn ids(found: Vec<(usize, InodeId)>) -> Vec<InodeId> {
    found.into_iter().map(|(_, id)| id).collect()
}

fn check_ttl(ttl: Option<Ttl>) -> Result<()> {
    match ttl {
        Some(t) if t.duration_ms < 0 => Err(MasterError::InvalidArgument(format!(
            "ttl must not be negative, got {}ms",
            t.duration_ms
        ))),
        _ => Ok(()),
    }
}

/// The deepest existing inode of `locked` must be a directory and, unless
/// ancestors may be created, the direct parent of the target.
fn check_create_parent(locked: &LockedPath, create_ancestors: bool) -> Result<()> {
    let path = locked.path();
    if locked.missing_segments().len() > 1 && !create_ancestors {
        let parent = path.parent().unwrap_or_else(NsPath::root);
        return Err(MasterError::PathNotFound(parent.to_string()));
    }
    if !locked.deepest().is_directory() {
        return Err(MasterError::NotADirectory(
            path.ancestor(locked.existing_depth()).to_string(),
        ));
    }
    Ok(())
}

fn ufs_error(path: &NsPath, e: io::Error) -> MasterError {
    MasterError::ufs(path.to_string(), e)
}

impl NamespaceMaster {
    /// Directories for every missing segment of `locked` but the last.
    fn synthesize_ancestors(
        &self,
        locked: &LockedPath,
        now: i64,
        owner: &str,
        group: &str,
        state: PersistenceState,
    ) -> Vec<Inode> {
        let missing = locked.missing_segments();
        let pinned = locked.deepest().pinned;
        let mut parent = locked.deepest().id;
        let mut out = Vec::new();
        for name in &missing[..missing.len().saturating_sub(1)] {
            let mut dir = Inode::new_directory(self.tree.allocate_id(), parent, name, now);
            dir.owner = owner.to_string();
            dir.group = group.to_string();
            dir.mode = DEFAULT_DIRECTORY_MODE;
            dir.pinned = pinned;
            dir.persistence_state = state;
            parent = dir.id;
            out.push(dir);
        }
        out
    }

    pub(crate) async fn file_info(&self, path: &NsPath, inode: &Inode) -> Result<FileInfo> {
        let res = self.mounts.resolve(path).await?;
        Ok(inode.to_file_info(path.to_string(), res.mount_id, res.full_ufs_path()))
    }

    pub async fn create_file(&self, path: &NsPath, options: &CreateFileOptions) -> Result<InodeId> {
        if path.is_root() {
            return Err(MasterError::AlreadyExists(path.to_string()));
        }
        check_ttl(options.ttl)?;
        let through = options.persist_type == PersistType::Through;
        let _gate = self.begin_mutation().await?;
        let mut locked = self
            .lock_widening(path, path.depth() - 1, true, |l| {
                if through {
                    first_depth(unpersisted_ancestors(l))
                } else {
                    None
                }
            })
            .await?;
        if let Ok(existing) = locked.target() {
            if options.allow_exists && existing.is_file() {
                return Ok(existing.id);
            }
            return Err(MasterError::AlreadyExists(path.to_string()));
        }
        check_create_parent(&locked, options.create_ancestors)?;
        let res = self.mounts.resolve(path).await?;
        if res.read_only {
            return Err(MasterError::PermissionDenied(format!(
                "{path} is under a read-only mount"
            )));
        }

        let now = now_ms();
        let state = if through {
            PersistenceState::Persisted
        } else {
            PersistenceState::NotPersisted
        };
        let persist_ancestors = if through {
            ids(unpersisted_ancestors(&locked))
        } else {
            Vec::new()
        };
        let mut chain =
            self.synthesize_ancestors(&locked, now, &options.owner, &options.group, state);
        let parent_id = chain.last().map_or(locked.deepest().id, |d| d.id);
        let block_size = if options.block_size_bytes == 0 {
            self.config.default_block_size_bytes
        } else {
            options.block_size_bytes
        };
        let name = path.name().unwrap_or_default();
        let mut file = Inode::new_file(
            self.tree.allocate_id(),
            parent_id,
            name,
            now,
            block_size,
            options.persist_type,
        );
        file.owner = options.owner.clone();
        file.group = options.group.clone();
        file.mode = options.mode;
        file.ttl = options.ttl;
        file.pinned = locked.deepest().pinned;
        let id = file.id;
        chain.push(file);

        if through {
            if let Some(parent) = path.parent() {
                let parent_res = self.mounts.resolve(&parent).await?;
                parent_res
                    .ufs
                    .mkdirs(&parent_res.ufs_path)
                    .await
                    .map_err(|e| ufs_error(&parent, e))?;
            }
        }

        let op = CreateOp {
            path: path.to_string(),
            inodes: chain,
            persist_ancestors,
            op_time_ms: now,
        };
        self.journal(&JournalOp::Create(op.clone())).await?;
        self.apply_create(&mut locked, &op).await?;
        debug!("created file {path} as {id}");
        Ok(id)
    }

    pub async fn create_directory(
        &self,
        path: &NsPath,
        options: &CreateDirectoryOptions,
    ) -> Result<InodeId> {
        if path.is_root() {
            if options.allow_exists {
                return Ok(ROOT_INODE_ID);
            }
            return Err(MasterError::AlreadyExists(path.to_string()));
        }
        check_ttl(options.ttl)?;
        let persisted = options.persisted;
        let _gate = self.begin_mutation().await?;
        let mut locked = self
            .lock_widening(path, path.depth() - 1, true, |l| {
                if persisted {
                    first_depth(unpersisted_ancestors(l))
                } else {
                    None
                }
            })
            .await?;
        if let Ok(existing) = locked.target() {
            if options.allow_exists && existing.is_directory() {
                return Ok(existing.id);
            }
            return Err(MasterError::AlreadyExists(path.to_string()));
        }
        check_create_parent(&locked, options.create_ancestors)?;
        let res = self.mounts.resolve(path).await?;
        if res.read_only {
            return Err(MasterError::PermissionDenied(format!(
                "{path} is under a read-only mount"
            )));
        }

        let mut fresh_in_ufs = false;
        if persisted {
            let existing = res
                .ufs
                .get_status(&res.ufs_path)
                .await
                .map_err(|e| ufs_error(path, e))?;
            match existing {
                Some(status) if !status.is_directory => {
                    return Err(MasterError::AlreadyExists(format!(
                        "{path} exists in UFS as a file"
                    )));
                }
                Some(_) => {}
                None => fresh_in_ufs = true,
            }
            res.ufs
                .mkdirs(&res.ufs_path)
                .await
                .map_err(|e| ufs_error(path, e))?;
        }

        let now = now_ms();
        let state = if persisted {
            PersistenceState::Persisted
        } else {
            PersistenceState::NotPersisted
        };
        let persist_ancestors = if persisted {
            ids(unpersisted_ancestors(&locked))
        } else {
            Vec::new()
        };
        let mut chain =
            self.synthesize_ancestors(&locked, now, &options.owner, &options.group, state);
        let parent_id = chain.last().map_or(locked.deepest().id, |d| d.id);
        let mut dir = Inode::new_directory(
            self.tree.allocate_id(),
            parent_id,
            path.name().unwrap_or_default(),
            now,
        );
        dir.owner = options.owner.clone();
        dir.group = options.group.clone();
        dir.mode = options.mode;
        dir.ttl = options.ttl;
        dir.pinned = locked.deepest().pinned;
        dir.persistence_state = state;
        if let Some(body) = dir.as_directory_mut() {
            // nothing in UFS that the tree does not know about
            body.direct_children_loaded = fresh_in_ufs;
        }
        let id = dir.id;
        chain.push(dir);

        let op = CreateOp {
            path: path.to_string(),
            inodes: chain,
            persist_ancestors,
            op_time_ms: now,
        };
        self.journal(&JournalOp::Create(op.clone())).await?;
        self.apply_create(&mut locked, &op).await?;
        debug!("created directory {path} as {id}");
        Ok(id)
    }

    pub async fn delete(&self, path: &NsPath, options: &DeleteOptions) -> Result<()> {
        if path.is_root() {
            return Err(MasterError::invalid_path("/", "the root cannot be deleted"));
        }
        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_path(path, LockPattern::WriteParent).await?;
        let target = locked.target()?;
        if target.is_mount_point() {
            return Err(MasterError::invalid_path(
                path.to_string(),
                "is a mount point, unmount it instead",
            ));
        }
        if target.has_children() && !options.recursive {
            return Err(MasterError::DirectoryNotEmpty(path.to_string()));
        }
        let res = self.mounts.resolve(path).await?;
        if res.read_only && !options.metadata_only {
            return Err(MasterError::PermissionDenied(format!(
                "{path} is under a read-only mount"
            )));
        }
        if let Some(nested) = self.mounts.mounts_under(path).await.first() {
            return Err(MasterError::MountConflict(format!(
                "{path} contains the mount point {}",
                nested.path
            )));
        }

        let mut blocks: Vec<BlockId> = target.block_ids().to_vec();
        {
            let subtree = self.lock_subtree(&locked, false).await?;
            let mut entries: Vec<(NsPath, &Inode)> = vec![(path.clone(), target)];
            entries.extend(subtree.iter().map(|e| (e.path_under(path), &*e.inode)));
            for (p, inode) in entries {
                if !options.forced {
                    if inode.pinned {
                        return Err(MasterError::FailedPrecondition(format!(
                            "{p} is pinned"
                        )));
                    }
                    if inode.persistence_state == PersistenceState::ToBePersisted
                        || self.is_persist_scheduled(inode.id)
                    {
                        return Err(MasterError::FailedPrecondition(format!(
                            "{p} has persistence in flight"
                        )));
                    }
                }
                if inode.id != target.id {
                    blocks.extend_from_slice(inode.block_ids());
                }
            }
        }

        if !options.metadata_only && target.is_persisted() {
            match res.ufs.delete(&res.ufs_path, true).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{path} was already gone from UFS");
                }
                Err(e) => return Err(ufs_error(path, e)),
            }
        }

        let op = DeleteOp {
            path: path.to_string(),
            id: target.id,
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::Delete(op.clone())).await?;
        let removed = self.apply_delete(&mut locked, &op).await?;
        drop(locked);
        debug!("deleted {path} ({} inodes)", removed.len());
        if !blocks.is_empty() {
            if let Err(e) = self.data_plane.evict(&blocks).await {
                warn!("evicting blocks of deleted {path} failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn rename(&self, src: &NsPath, dst: &NsPath) -> Result<()> {
        if src.is_root() || dst.is_root() {
            return Err(MasterError::invalid_path("/", "the root cannot be renamed"));
        }
        let _gate = self.begin_mutation().await?;
        let mut pair = self.tree.lock_pair(src, dst).await?;
        let source = pair
            .src_target()
            .ok_or_else(|| MasterError::PathNotFound(src.to_string()))?;
        let dst_parent = pair.dst_parent().ok_or_else(|| {
            MasterError::PathNotFound(dst.parent().unwrap_or_else(NsPath::root).to_string())
        })?;
        if !dst_parent.is_directory() {
            return Err(MasterError::NotADirectory(
                dst.parent().unwrap_or_else(NsPath::root).to_string(),
            ));
        }
        if pair.dst_target().is_some() {
            return Err(MasterError::AlreadyExists(dst.to_string()));
        }
        if source.is_mount_point() {
            return Err(MasterError::invalid_path(
                src.to_string(),
                "a mount point cannot be renamed",
            ));
        }
        if let Some(nested) = self.mounts.mounts_under(src).await.first() {
            return Err(MasterError::MountConflict(format!(
                "{src} contains the mount point {}",
                nested.path
            )));
        }
        let src_res = self.mounts.resolve(src).await?;
        let dst_res = self.mounts.resolve(dst).await?;
        if src_res.mount_id != dst_res.mount_id {
            return Err(MasterError::invalid_path(
                dst.to_string(),
                format!(
                    "cannot rename across mount points {} and {}",
                    src_res.mount_path, dst_res.mount_path
                ),
            ));
        }
        if src_res.read_only {
            return Err(MasterError::PermissionDenied(format!(
                "{src} is under a read-only mount"
            )));
        }
        if source.is_persisted() {
            if !dst_parent.is_persisted() {
                return Err(MasterError::FailedPrecondition(format!(
                    "{src} is persisted but the parent of {dst} is not"
                )));
            }
            src_res
                .ufs
                .rename(&src_res.ufs_path, &dst_res.ufs_path)
                .await
                .map_err(|e| ufs_error(src, e))?;
        }
        let op = RenameOp {
            src: src.to_string(),
            dst: dst.to_string(),
            id: source.id,
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::Rename(op.clone())).await?;
        self.apply_rename(&mut pair, &op)?;
        debug!("renamed {src} to {dst}");
        Ok(())
    }

    pub async fn set_attribute(&self, path: &NsPath, options: &SetAttributeOptions) -> Result<()> {
        if options.is_empty() {
            return Err(MasterError::InvalidArgument(
                "no attribute to set".to_string(),
            ));
        }
        if options.persisted == Some(false) {
            return Err(MasterError::InvalidArgument(
                "persisted can only be set, not cleared".to_string(),
            ));
        }
        if let Some(common::TtlSetting::Set(ttl)) = options.ttl {
            check_ttl(Some(ttl))?;
        }
        let persisting = options.persisted == Some(true);
        let _gate = self.begin_mutation().await?;
        let mut locked = self
            .lock_widening(path, path.depth(), false, |l| {
                if persisting {
                    first_depth(unpersisted_ancestors(l))
                } else {
                    None
                }
            })
            .await?;
        let target = locked.target()?;
        if persisting {
            if let Some(file) = target.as_file() {
                if !file.completed {
                    return Err(MasterError::FileNotCompleted(path.to_string()));
                }
            }
        }
        let id = target.id;
        let persist_ancestors = if persisting && !target.is_persisted() {
            ids(unpersisted_ancestors(&locked))
        } else {
            Vec::new()
        };
        let mut subtree = if wants_subtree(options) {
            self.lock_subtree(&locked, true).await?
        } else {
            Vec::new()
        };
        let op = SetAttributeOp {
            path: path.to_string(),
            id,
            options: options.clone(),
            persist_ancestors,
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::SetAttribute(op.clone())).await?;
        self.apply_set_attribute(&mut locked, &mut subtree, &op)?;
        Ok(())
    }

    pub async fn complete_file(&self, path: &NsPath, options: &CompleteFileOptions) -> Result<()> {
        let _gate = self.begin_mutation().await?;
        let mut locked = self
            .lock_widening(path, path.depth(), false, |l| {
                let through = l.target().ok().and_then(|t| t.as_file()).is_some_and(|f| {
                    f.persist_type == PersistType::Through && !f.completed
                });
                if through {
                    first_depth(unpersisted_ancestors(l))
                } else {
                    None
                }
            })
            .await?;
        let target = locked.target()?;
        let file = target
            .as_file()
            .ok_or_else(|| MasterError::IsADirectory(path.to_string()))?;
        if file.completed {
            return Err(MasterError::FileAlreadyCompleted(path.to_string()));
        }
        let capacity = (file.block_ids.len() as u64).saturating_mul(file.block_size_bytes);
        if options.length > capacity {
            return Err(MasterError::InvalidArgument(format!(
                "length {} of {path} exceeds its {} allocated blocks",
                options.length,
                file.block_ids.len()
            )));
        }
        let (state, persist_ancestors) = match file.persist_type {
            PersistType::Through => {
                if let Some(ufs_length) = options.ufs_length {
                    if ufs_length != options.length {
                        return Err(MasterError::InvalidArgument(format!(
                            "ufs length {ufs_length} differs from length {}",
                            options.length
                        )));
                    }
                }
                (
                    PersistenceState::Persisted,
                    ids(unpersisted_ancestors(&locked)),
                )
            }
            PersistType::AsyncThrough => (PersistenceState::ToBePersisted, Vec::new()),
            PersistType::MustCache => (PersistenceState::NotPersisted, Vec::new()),
        };
        let op = CompleteFileOp {
            path: path.to_string(),
            id: target.id,
            length: options.length,
            state,
            persist_ancestors,
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::CompleteFile(op.clone())).await?;
        self.apply_complete_file(&mut locked, &op)?;
        if state == PersistenceState::ToBePersisted {
            self.persist.enqueue(op.id);
        }
        debug!("completed {path} at {} bytes", options.length);
        Ok(())
    }

    pub async fn free(&self, path: &NsPath, options: &FreeOptions) -> Result<()> {
        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_path(path, LockPattern::WriteInode).await?;
        let target = locked.target()?;
        if target.has_children() && !options.recursive {
            return Err(MasterError::DirectoryNotEmpty(path.to_string()));
        }
        let id = target.id;
        let mut subtree = self.lock_subtree(&locked, true).await?;
        let mut files = Vec::new();
        let mut blocks = Vec::new();
        {
            let mut entries: Vec<(NsPath, &Inode)> = vec![(path.clone(), locked.target()?)];
            entries.extend(subtree.iter().map(|e| (e.path_under(path), &*e.inode)));
            for (p, inode) in entries {
                if inode.pinned && !options.forced {
                    return Err(MasterError::FailedPrecondition(format!(
                        "{p} is pinned"
                    )));
                }
                let Some(file) = inode.as_file() else {
                    continue;
                };
                if !inode.is_persisted() {
                    return Err(MasterError::FailedPrecondition(format!(
                        "{p} is not persisted and cannot be freed"
                    )));
                }
                if file.cached {
                    files.push(inode.id);
                    blocks.extend_from_slice(&file.block_ids);
                }
            }
        }
        if files.is_empty() {
            return Ok(());
        }
        let op = FreeOp {
            path: path.to_string(),
            id,
            files,
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::Free(op.clone())).await?;
        self.apply_free(&mut locked, &mut subtree, &op)?;
        drop(subtree);
        drop(locked);
        if let Err(e) = self.data_plane.evict(&blocks).await {
            warn!("evicting blocks of freed {path} failed: {e}");
        }
        Ok(())
    }

    pub async fn get_new_block_id_for_file(&self, path: &NsPath) -> Result<BlockId> {
        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_path(path, LockPattern::WriteInode).await?;
        let target = locked.target()?;
        let file = target
            .as_file()
            .ok_or_else(|| MasterError::IsADirectory(path.to_string()))?;
        if file.completed {
            return Err(MasterError::FileAlreadyCompleted(path.to_string()));
        }
        let op = NewBlockOp {
            path: path.to_string(),
            id: target.id,
            block_id: self.blocks.allocate(),
        };
        self.journal(&JournalOp::NewBlock(op.clone())).await?;
        self.apply_new_block(&mut locked, &op)?;
        Ok(op.block_id)
    }

    pub async fn schedule_async_persist(&self, path: &NsPath) -> Result<()> {
        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_path(path, LockPattern::WriteInode).await?;
        let target = locked.target()?;
        let file = target
            .as_file()
            .ok_or_else(|| MasterError::IsADirectory(path.to_string()))?;
        if !file.completed {
            return Err(MasterError::FileNotCompleted(path.to_string()));
        }
        let id = target.id;
        match target.persistence_state {
            PersistenceState::Persisted => return Ok(()),
            PersistenceState::ToBePersisted => {}
            PersistenceState::NotPersisted => {
                let res = self.mounts.resolve(path).await?;
                if res.read_only {
                    return Err(MasterError::PermissionDenied(format!(
                        "{path} is under a read-only mount"
                    )));
                }
                let op = PersistStateOp {
                    path: path.to_string(),
                    id,
                    state: PersistenceState::ToBePersisted,
                    persist_ancestors: Vec::new(),
                    op_time_ms: now_ms(),
                };
                self.journal(&JournalOp::PersistState(op.clone())).await?;
                self.apply_persist_state(&mut locked, &op)?;
            }
        }
        self.persist.clear_failure(id);
        self.persist.enqueue(id);
        Ok(())
    }

    pub async fn get_status(&self, path: &NsPath, options: &GetStatusOptions) -> Result<FileInfo> {
        if options.load_metadata != LoadMetadataType::Never {
            let exists = self
                .tree
                .lock_path(path, LockPattern::Read)
                .await?
                .is_full();
            if !exists {
                let load = LoadMetadataOptions {
                    create_ancestors: true,
                    load_direct_children: false,
                    recursive: false,
                };
                self.load_metadata(path, &load).await?;
            }
        }
        let locked = self.tree.lock_path(path, LockPattern::Read).await?;
        self.file_info(path, locked.target()?).await
    }

    pub async fn get_status_by_id(&self, id: InodeId) -> Result<FileInfo> {
        // a concurrent rename can move the inode between the lookups
        for _ in 0..3 {
            let Some(path) = self.tree.path_of(id).await else {
                break;
            };
            let locked = self.tree.lock_path(&path, LockPattern::Read).await?;
            if let Ok(inode) = locked.target() {
                if inode.id == id {
                    return self.file_info(&path, inode).await;
                }
            }
        }
        Err(MasterError::PathNotFound(format!("inode {id}")))
    }

    pub async fn list_status(
        &self,
        path: &NsPath,
        options: &ListStatusOptions,
    ) -> Result<Vec<FileInfo>> {
        if let Some(load) = self.listing_load(path, options).await? {
            self.load_metadata(path, &load).await?;
        }
        let locked = self.tree.lock_path(path, LockPattern::Read).await?;
        let target = locked.target()?;
        if !target.is_directory() {
            return Ok(vec![self.file_info(path, target).await?]);
        }
        let entries = if options.recursive {
            self.tree.lock_descendants(target, false).await?
        } else {
            self.tree.lock_children(target, false).await?
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            out.push(self.file_info(&entry.path_under(path), &entry.inode).await?);
        }
        Ok(out)
    }

    /// Metadata to load from UFS before listing `path`, if any.
    async fn listing_load(
        &self,
        path: &NsPath,
        options: &ListStatusOptions,
    ) -> Result<Option<LoadMetadataOptions>> {
        let mode = options.load_metadata;
        if mode == LoadMetadataType::Never {
            return Ok(None);
        }
        let locked = self.tree.lock_path(path, LockPattern::Read).await?;
        let load = LoadMetadataOptions {
            create_ancestors: true,
            load_direct_children: true,
            recursive: options.recursive,
        };
        let Ok(target) = locked.target() else {
            return Ok(Some(load));
        };
        let stale = target.as_directory().is_some_and(|d| {
            target.is_persisted() && (mode == LoadMetadataType::Always || !d.direct_children_loaded)
        });
        Ok(stale.then_some(load))
    }

    /// Block layout of a file, for the legacy block listing call.
    pub async fn get_file_block_info_list(&self, path: &NsPath) -> Result<Vec<FileBlockInfo>> {
        let info = self.get_status(path, &GetStatusOptions::default()).await?;
        if info.is_directory() {
            return Err(MasterError::IsADirectory(path.to_string()));
        }
        Ok(info.block_infos())
    }
}
