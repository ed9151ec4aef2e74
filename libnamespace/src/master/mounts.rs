use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use common::{
    InodeId, LoadMetadataOptions, MountOptions, PersistType, PersistenceState, UnmountOptions,
};

use crate::error::{MasterError, Result};
use crate::inode::{Inode, InodeOrigin};
use crate::journal::{JournalOp, LoadMetadataOp, MountOp, UnmountOp};
use crate::lock::LockPattern;
use crate::mount::{MountEntry, ROOT_MOUNT_ID};
use crate::path::{NsPath, join_ufs};
use crate::ufs::{UfsStatus, UnderFileSystem};

use super::{NamespaceMaster, now_ms};

/// A UFS entry found below the directory being loaded.
struct Listed {
    relative: Vec<String>,
    status: UfsStatus,
}

/// Result of listing a UFS directory, possibly recursively.
#[derive(Default)]
struct Scan {
    entries: Vec<Listed>,
    /// Directories, relative to the top, whose listing succeeded.
    listed: HashSet<Vec<String>>,
}

async fn scan(ufs: &dyn UnderFileSystem, top: &str, at: &NsPath, recursive: bool) -> Result<Scan> {
    let mut out = Scan::default();
    let mut stack: Vec<Vec<String>> = vec![Vec::new()];
    while let Some(relative) = stack.pop() {
        let dir = join_ufs(top, &relative);
        let children = match ufs.list_status(&dir).await {
            Ok(Some(children)) => children,
            Ok(None) => continue,
            Err(e) if relative.is_empty() => return Err(MasterError::ufs(at.to_string(), e)),
            Err(e) => {
                warn!("skipping {dir} while loading {at}: {e}");
                continue;
            }
        };
        let mut subdirs = Vec::new();
        for status in children {
            let mut rel = relative.clone();
            rel.push(status.name.clone());
            if status.is_directory && recursive {
                subdirs.push(rel.clone());
            }
            out.entries.push(Listed {
                relative: rel,
                status,
            });
        }
        out.listed.insert(relative);
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(out)
}

impl NamespaceMaster {
    /// Inode mirroring a UFS entry.
    fn mirror_inode(&self, parent: InodeId, status: &UfsStatus, now: i64) -> Inode {
        let id = self.tree.allocate_id();
        let mut inode = if status.is_directory {
            Inode::new_directory(id, parent, &status.name, now)
        } else {
            let mut file = Inode::new_file(
                id,
                parent,
                &status.name,
                now,
                self.config.default_block_size_bytes,
                PersistType::MustCache,
            );
            if let Some(body) = file.as_file_mut() {
                body.completed = true;
                body.length = status.length;
            }
            file
        };
        inode.origin = InodeOrigin::Loaded;
        inode.persistence_state = PersistenceState::Persisted;
        inode.last_modification_time_ms = status.modification_time_ms;
        inode
    }

    pub async fn mount(&self, path: &NsPath, ufs_uri: &str, options: MountOptions) -> Result<()> {
        if path.is_root() {
            return Err(MasterError::MountConflict("/ is always mounted".to_string()));
        }
        self.ensure_running()?;
        // The UFS root is validated before any lock is taken; the table is
        // checked again once it is held.
        self.mounts.check_uri(ufs_uri).await?;
        let ufs = self
            .ufs_factory
            .create(ufs_uri, &options.properties)
            .map_err(|e| MasterError::ufs(ufs_uri, e))?;
        match ufs.get_status("/").await {
            Ok(Some(status)) if status.is_directory => {}
            Ok(_) => {
                return Err(MasterError::invalid_path(
                    ufs_uri,
                    "is not a directory in UFS",
                ));
            }
            Err(e) => return Err(MasterError::ufs(ufs_uri, e)),
        }

        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_for_create(path).await?;
        if locked.is_full() {
            return Err(MasterError::AlreadyExists(path.to_string()));
        }
        if locked.missing_segments().len() > 1 {
            let parent = path.parent().unwrap_or_else(NsPath::root);
            return Err(MasterError::PathNotFound(parent.to_string()));
        }
        if !locked.deepest().is_directory() {
            return Err(MasterError::NotADirectory(
                path.ancestor(locked.existing_depth()).to_string(),
            ));
        }
        let _table = self.lock_mount_table().await;
        self.mounts.check_add(path, ufs_uri).await?;

        let now = now_ms();
        let mut inode = Inode::new_directory(
            self.tree.allocate_id(),
            locked.deepest().id,
            path.name().unwrap_or_default(),
            now,
        );
        inode.origin = InodeOrigin::Loaded;
        inode.persistence_state = PersistenceState::Persisted;
        if let Some(dir) = inode.as_directory_mut() {
            dir.mount_point = true;
        }
        let op = MountOp {
            entry: MountEntry {
                mount_id: self.mounts.next_mount_id().await,
                path: path.to_string(),
                ufs_uri: ufs_uri.to_string(),
                options,
            },
            inode,
        };
        self.journal(&JournalOp::Mount(op.clone())).await?;
        self.apply_mount(&mut locked, &op).await?;
        Ok(())
    }

    pub async fn unmount(&self, path: &NsPath, options: &UnmountOptions) -> Result<()> {
        if path.is_root() {
            return Err(MasterError::invalid_path("/", "the root cannot be unmounted"));
        }
        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_path(path, LockPattern::WriteParent).await?;
        let target = locked.target()?;
        if !target.is_mount_point() {
            return Err(MasterError::invalid_path(path.to_string(), "not a mount point"));
        }
        let _table = self.lock_mount_table().await;
        let entry = self
            .mounts
            .get(path)
            .await
            .ok_or_else(|| MasterError::invalid_path(path.to_string(), "not a mount point"))?;
        if let Some(nested) = self.mounts.mounts_under(path).await.first() {
            return Err(MasterError::MountConflict(format!(
                "{path} contains the mount point {}",
                nested.path
            )));
        }
        if !options.forced {
            if target.pinned {
                return Err(MasterError::FailedPrecondition(format!("{path} is pinned")));
            }
            if target.persistence_state == PersistenceState::ToBePersisted
                || self.is_persist_scheduled(target.id)
            {
                return Err(MasterError::FailedPrecondition(format!(
                    "{path} has persistence in flight"
                )));
            }
        }
        let mut subtree = self.lock_subtree(&locked, true).await?;

        let mut removed = Vec::new();
        let mut reset = Vec::new();
        let mut keeps_child: HashSet<Vec<String>> = HashSet::new();
        for item in subtree.iter().rev() {
            let p = item.path_under(path);
            if !options.forced {
                if item.inode.pinned {
                    return Err(MasterError::FailedPrecondition(format!("{p} is pinned")));
                }
                if item.inode.persistence_state == PersistenceState::ToBePersisted
                    || self.is_persist_scheduled(item.inode.id)
                {
                    return Err(MasterError::FailedPrecondition(format!(
                        "{p} has persistence in flight"
                    )));
                }
            }
            let created = item.inode.origin == InodeOrigin::Created && !options.drop_created;
            if created || keeps_child.contains(&item.relative) {
                reset.push(item.inode.id);
                let parent = item.relative[..item.relative.len() - 1].to_vec();
                keeps_child.insert(parent);
            } else {
                removed.push(item.inode.id);
            }
        }
        if keeps_child.contains(&Vec::new()) {
            reset.push(target.id);
        } else {
            removed.push(target.id);
        }
        let op = UnmountOp {
            path: path.to_string(),
            mount_id: entry.mount_id,
            removed,
            reset,
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::Unmount(op.clone())).await?;
        self.apply_unmount(&mut locked, &mut subtree, &op).await?;
        info!(
            "unmounted {path}: dropped {} inodes, kept {}",
            op.removed.len(),
            op.reset.len()
        );
        Ok(())
    }

    /// Every mount, the root first.
    pub async fn get_mount_table(&self) -> Vec<MountEntry> {
        self.mounts.list().await
    }

    /// UFS location of the root mount.
    pub async fn get_ufs_address(&self) -> Result<String> {
        self.mounts
            .root()
            .await
            .filter(|m| m.mount_id == ROOT_MOUNT_ID)
            .map(|m| m.ufs_uri)
            .ok_or_else(|| MasterError::Internal("root mount missing".to_string()))
    }

    /// Mirror UFS metadata for `path` into the tree and return its id.
    pub async fn load_metadata(&self, path: &NsPath, options: &LoadMetadataOptions) -> Result<InodeId> {
        // a concurrent create can change what is missing between the passes
        for _ in 0..3 {
            if let Some(id) = self.try_load_metadata(path, options).await? {
                return Ok(id);
            }
            debug!("namespace changed while loading {path}, retrying");
        }
        Err(MasterError::FailedPrecondition(format!(
            "{path} keeps changing during metadata load"
        )))
    }

    async fn try_load_metadata(
        &self,
        path: &NsPath,
        options: &LoadMetadataOptions,
    ) -> Result<Option<InodeId>> {
        let (existing_depth, existing_id) = {
            let locked = self.tree.lock_path(path, LockPattern::Read).await?;
            let deepest = locked.deepest();
            if locked.is_full() {
                let loadable = deepest.is_directory()
                    && deepest.is_persisted()
                    && options.load_direct_children;
                if !loadable {
                    return Ok(Some(deepest.id));
                }
            } else if !deepest.is_directory() || !deepest.is_persisted() {
                return Err(MasterError::PathNotFound(path.to_string()));
            }
            (locked.existing_depth(), deepest.id)
        };
        if existing_depth == path.depth() {
            self.load_children(path, existing_id, options).await
        } else {
            self.load_missing(path, existing_depth, options).await
        }
    }

    /// Load the children of an existing persisted directory.
    async fn load_children(
        &self,
        path: &NsPath,
        id: InodeId,
        options: &LoadMetadataOptions,
    ) -> Result<Option<InodeId>> {
        let res = self.mounts.resolve(path).await?;
        let found = scan(&*res.ufs, &res.ufs_path, path, options.recursive).await?;

        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_path(path, LockPattern::WriteInode).await?;
        match locked.target() {
            Ok(target) if target.id == id => {}
            _ => return Ok(None),
        }
        let mut subtree = self.lock_subtree(&locked, true).await?;

        // relative path -> (id, is directory, may receive loaded children)
        let mut known: HashMap<Vec<String>, (InodeId, bool, bool)> = HashMap::new();
        known.insert(Vec::new(), (id, true, true));
        for entry in &subtree {
            let inode = &entry.inode;
            let parent_open = known
                .get(&entry.relative[..entry.relative.len() - 1])
                .is_some_and(|k| k.2);
            let open = parent_open
                && inode.is_directory()
                && inode.is_persisted()
                && !inode.is_mount_point();
            known.insert(entry.relative.clone(), (inode.id, inode.is_directory(), open));
        }
        let mut loaded_dirs = Vec::new();
        {
            let target = locked.target()?;
            if found.listed.contains(&Vec::new())
                && !target.as_directory().is_some_and(|d| d.direct_children_loaded)
            {
                loaded_dirs.push(id);
            }
        }
        for entry in &subtree {
            let fresh = entry
                .inode
                .as_directory()
                .is_some_and(|d| !d.direct_children_loaded);
            let open = known.get(&entry.relative).is_some_and(|k| k.2);
            if fresh && open && found.listed.contains(&entry.relative) {
                loaded_dirs.push(entry.inode.id);
            }
        }

        let now = now_ms();
        let mut children = Vec::new();
        for item in &found.entries {
            if known.contains_key(&item.relative) {
                continue;
            }
            let parent_rel = &item.relative[..item.relative.len() - 1];
            let Some(&(parent, true, true)) = known.get(parent_rel) else {
                continue;
            };
            let mut inode = self.mirror_inode(parent, &item.status, now);
            if found.listed.contains(&item.relative) {
                if let Some(dir) = inode.as_directory_mut() {
                    dir.direct_children_loaded = true;
                }
            }
            known.insert(
                item.relative.clone(),
                (inode.id, inode.is_directory(), inode.is_directory()),
            );
            children.push(inode);
        }
        if children.is_empty() && loaded_dirs.is_empty() {
            return Ok(Some(id));
        }
        let op = LoadMetadataOp {
            path: path.to_string(),
            ancestors: Vec::new(),
            children,
            loaded_dirs,
            op_time_ms: now,
        };
        self.journal(&JournalOp::LoadMetadata(op.clone())).await?;
        self.apply_load_metadata(&mut locked, &mut subtree, &op).await?;
        debug!("loaded {} entries below {path}", op.children.len());
        Ok(Some(id))
    }

    /// Load `path` itself, and missing ancestors, from UFS.
    async fn load_missing(
        &self,
        path: &NsPath,
        existing_depth: usize,
        options: &LoadMetadataOptions,
    ) -> Result<Option<InodeId>> {
        if path.depth() - existing_depth > 1 && !options.create_ancestors {
            let parent = path.parent().unwrap_or_else(NsPath::root);
            return Err(MasterError::PathNotFound(parent.to_string()));
        }
        let res = self.mounts.resolve(path).await?;
        let mut statuses = Vec::new();
        for depth in existing_depth + 1..=path.depth() {
            let at = path.ancestor(depth);
            let ufs_at = strip_segments(&res.ufs_path, path.depth() - depth);
            let status = res
                .ufs
                .get_status(&ufs_at)
                .await
                .map_err(|e| MasterError::ufs(at.to_string(), e))?
                .ok_or_else(|| MasterError::PathNotFound(path.to_string()))?;
            if depth < path.depth() && !status.is_directory {
                return Err(MasterError::NotADirectory(at.to_string()));
            }
            statuses.push(status);
        }
        let is_dir = statuses.last().is_some_and(|s| s.is_directory);
        let found = if is_dir && options.load_direct_children {
            scan(&*res.ufs, &res.ufs_path, path, options.recursive).await?
        } else {
            Scan::default()
        };

        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_for_create(path).await?;
        if locked.is_full() {
            return Ok(Some(locked.deepest().id));
        }
        if locked.existing_depth() != existing_depth {
            return Ok(None);
        }
        let now = now_ms();
        let mut parent = locked.deepest().id;
        let mut ancestors = Vec::with_capacity(statuses.len());
        for status in &statuses {
            let inode = self.mirror_inode(parent, status, now);
            parent = inode.id;
            ancestors.push(inode);
        }
        let target_id = parent;
        let mut children = Vec::new();
        if let Some(last) = ancestors.last_mut() {
            if found.listed.contains(&Vec::new()) {
                if let Some(dir) = last.as_directory_mut() {
                    dir.direct_children_loaded = true;
                }
            }
        }
        let mut known: HashMap<Vec<String>, InodeId> = HashMap::new();
        known.insert(Vec::new(), target_id);
        for item in &found.entries {
            let parent_rel = &item.relative[..item.relative.len() - 1];
            let Some(&parent) = known.get(parent_rel) else {
                continue;
            };
            let mut inode = self.mirror_inode(parent, &item.status, now);
            if let Some(dir) = inode.as_directory_mut() {
                dir.direct_children_loaded = found.listed.contains(&item.relative);
                known.insert(item.relative.clone(), inode.id);
            }
            children.push(inode);
        }
        let op = LoadMetadataOp {
            path: path.to_string(),
            ancestors,
            children,
            loaded_dirs: Vec::new(),
            op_time_ms: now,
        };
        self.journal(&JournalOp::LoadMetadata(op.clone())).await?;
        self.apply_load_metadata(&mut locked, &mut [], &op).await?;
        debug!(
            "loaded {path} with {} ancestors and {} children",
            op.ancestors.len() - 1,
            op.children.len()
        );
        Ok(Some(target_id))
    }
}

/// Drop the last `n` segments of a UFS path.
fn strip_segments(ufs_path: &str, n: usize) -> String {
    let segs: Vec<&str> = ufs_path.split('/').filter(|s| !s.is_empty()).collect();
    let keep = segs.len().saturating_sub(n);
    let rest: Vec<String> = segs[..keep].iter().map(|s| s.to_string()).collect();
    join_ufs("/", &rest)
}
