//! The inode arena and its locking discipline.
//!
//! Inodes live in an id-keyed arena; parent and child links are ids. Each
//! inode carries its own read/write lock. Path operations acquire those
//! locks strictly root-to-leaf, so operations on disjoint subtrees proceed
//! in parallel and no acquisition cycle can form. The arena map itself is
//! only held for lookups and never across an inode lock acquisition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{InodeId, ROOT_INODE_ID};
use tokio::sync::RwLock;

use crate::error::{MasterError, Result};
use crate::inode::Inode;
use crate::lock::{LockPattern, LockedInode, LockedPair, LockedPath, SubtreeEntry};
use crate::path::NsPath;

pub type InodeCell = Arc<RwLock<Inode>>;

pub struct InodeTree {
    inodes: RwLock<HashMap<InodeId, InodeCell>>,
    next_id: AtomicU64,
}

impl InodeTree {
    pub fn new(root: Inode) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(root.id, Arc::new(RwLock::new(root)));
        Self {
            inodes: RwLock::new(inodes),
            next_id: AtomicU64::new(ROOT_INODE_ID + 1),
        }
    }

    /// Rebuild a tree from checkpointed inodes.
    pub fn restore(inodes: Vec<Inode>, next_id: InodeId) -> Result<Self, String> {
        check_invariants(&inodes)?;
        let max_id = inodes.iter().map(|i| i.id).max().unwrap_or(ROOT_INODE_ID);
        let map = inodes
            .into_iter()
            .map(|i| (i.id, Arc::new(RwLock::new(i))))
            .collect();
        Ok(Self {
            inodes: RwLock::new(map),
            next_id: AtomicU64::new(next_id.max(max_id + 1)),
        })
    }

    pub fn allocate_id(&self) -> InodeId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_id(&self) -> InodeId {
        self.next_id.load(Ordering::SeqCst)
    }

    fn observe_id(&self, id: InodeId) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.inodes.read().await.len()
    }

    async fn cell(&self, id: InodeId) -> Result<InodeCell> {
        self.inodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| MasterError::Internal(format!("inode {id} missing from arena")))
    }

    async fn lock_cell(&self, id: InodeId, write: bool) -> Result<LockedInode> {
        let cell = self.cell(id).await?;
        Ok(if write {
            LockedInode::Write(cell.write_owned().await)
        } else {
            LockedInode::Read(cell.read_owned().await)
        })
    }

    /// Descend from `start` (or the last guard in `out`) along
    /// `path.segments()[from..to]`, pushing one guard per resolved inode.
    /// Stops quietly at the first missing segment.
    async fn walk<F>(
        &self,
        start: Option<&Inode>,
        path: &NsPath,
        from: usize,
        to: usize,
        write_at: F,
        out: &mut Vec<LockedInode>,
    ) -> Result<()>
    where
        F: Fn(usize) -> bool,
    {
        for seg_idx in from..to {
            let current: &Inode = match out.last() {
                Some(g) => g,
                None => match start {
                    Some(s) => s,
                    None => return Ok(()),
                },
            };
            let Some(child_id) = current.child(&path.segments()[seg_idx]) else {
                return Ok(());
            };
            let depth = seg_idx + 1;
            out.push(self.lock_cell(child_id, write_at(depth)).await?);
        }
        Ok(())
    }

    async fn lock_with<F>(&self, path: &NsPath, write_at: F) -> Result<LockedPath>
    where
        F: Fn(usize) -> bool,
    {
        let mut guards = Vec::with_capacity(path.depth() + 1);
        guards.push(self.lock_cell(ROOT_INODE_ID, write_at(0)).await?);
        self.walk(None, path, 0, path.depth(), &write_at, &mut guards)
            .await?;
        Ok(LockedPath::new(path.clone(), guards))
    }

    pub async fn lock_path(&self, path: &NsPath, pattern: LockPattern) -> Result<LockedPath> {
        let depth = path.depth();
        self.lock_with(path, |d| pattern.write_at(d, depth)).await
    }

    /// Lock `path` with every inode at depth `write_from` or deeper in write
    /// mode.
    pub async fn lock_path_from(&self, path: &NsPath, write_from: usize) -> Result<LockedPath> {
        self.lock_with(path, |d| d >= write_from).await
    }

    /// Lock `path` so that the deepest existing inode is write locked, which
    /// is where a create (with or without ancestors) attaches new inodes.
    pub async fn lock_for_create(&self, path: &NsPath) -> Result<LockedPath> {
        self.lock_for_create_from(path, path.depth().saturating_sub(1))
            .await
    }

    /// As `lock_for_create`, also write locking everything from `write_from`.
    pub async fn lock_for_create_from(
        &self,
        path: &NsPath,
        mut write_from: usize,
    ) -> Result<LockedPath> {
        loop {
            let locked = self.lock_with(path, |d| d >= write_from).await?;
            if locked.deepest_is_write() {
                return Ok(locked);
            }
            // something above the old parent vanished meanwhile
            write_from = locked.existing_depth();
        }
    }

    /// Lock the source and destination of a rename. Neither path may enclose
    /// the other.
    pub async fn lock_pair(&self, src: &NsPath, dst: &NsPath) -> Result<LockedPair> {
        if src.starts_with(dst) || dst.starts_with(src) {
            return Err(MasterError::invalid_path(
                dst.to_string(),
                format!("cannot rename {src} onto its own ancestor or descendant"),
            ));
        }
        let common = src.common_depth(dst);
        let src_parent = src.depth() - 1;
        let dst_parent = dst.depth() - 1;

        let mut shared = Vec::with_capacity(common + 1);
        let shared_write = |d: usize| d == src_parent || d == dst_parent;
        shared.push(self.lock_cell(ROOT_INODE_ID, shared_write(0)).await?);
        self.walk(None, src, 0, common, shared_write, &mut shared)
            .await?;

        let mut src_branch = Vec::new();
        let mut dst_branch = Vec::new();
        if shared.len() == common + 1 {
            let fork: &Inode = &shared[common];
            let src_first = src.segments()[common] < dst.segments()[common];
            let (first, second) = if src_first { (src, dst) } else { (dst, src) };
            let mut first_branch = Vec::new();
            let mut second_branch = Vec::new();
            let first_parent = first.depth() - 1;
            let second_parent = second.depth() - 1;
            self.walk(
                Some(fork),
                first,
                common,
                first.depth(),
                |d| d >= first_parent,
                &mut first_branch,
            )
            .await?;
            self.walk(
                Some(fork),
                second,
                common,
                second.depth(),
                |d| d >= second_parent,
                &mut second_branch,
            )
            .await?;
            if src_first {
                src_branch = first_branch;
                dst_branch = second_branch;
            } else {
                src_branch = second_branch;
                dst_branch = first_branch;
            }
        }
        Ok(LockedPair::new(
            src.clone(),
            dst.clone(),
            shared,
            src_branch,
            dst_branch,
        ))
    }

    /// Lock the direct children of `top`, in name order.
    pub async fn lock_children(&self, top: &Inode, write: bool) -> Result<Vec<SubtreeEntry>> {
        let mut out = Vec::new();
        if let Some(dir) = top.as_directory() {
            for (name, &id) in &dir.children {
                out.push(SubtreeEntry {
                    relative: vec![name.clone()],
                    inode: self.lock_cell(id, write).await?,
                });
            }
        }
        Ok(out)
    }

    /// Lock every descendant of `top` below an already held lock on `top`,
    /// depth first with children in name order, parents before children.
    pub async fn lock_descendants(&self, top: &Inode, write: bool) -> Result<Vec<SubtreeEntry>> {
        let mut out = Vec::new();
        let mut stack: Vec<(Vec<String>, InodeId)> = Vec::new();
        if let Some(dir) = top.as_directory() {
            for (name, &id) in dir.children.iter().rev() {
                stack.push((vec![name.clone()], id));
            }
        }
        while let Some((relative, id)) = stack.pop() {
            let inode = self.lock_cell(id, write).await?;
            if let Some(dir) = inode.as_directory() {
                for (name, &child) in dir.children.iter().rev() {
                    let mut rel = relative.clone();
                    rel.push(name.clone());
                    stack.push((rel, child));
                }
            }
            out.push(SubtreeEntry { relative, inode });
        }
        Ok(out)
    }

    /// Current path of an inode, computed by walking parent links one lock
    /// at a time. Callers re-lock the returned path top-down and check the id.
    pub async fn path_of(&self, id: InodeId) -> Option<NsPath> {
        let mut names = Vec::new();
        let mut current = id;
        let limit = self.len().await;
        while current != ROOT_INODE_ID {
            if names.len() > limit {
                return None;
            }
            let cell = self.cell(current).await.ok()?;
            let inode = cell.read().await;
            names.push(inode.name.clone());
            current = inode.parent_id;
        }
        let mut path = NsPath::root();
        for name in names.iter().rev() {
            path = path.join(name).ok()?;
        }
        Some(path)
    }

    /// Attach a chain of new inodes below the write-locked deepest inode of
    /// `locked`. Each inode after the first is a child of its predecessor.
    pub async fn add_chain(
        &self,
        locked: &mut LockedPath,
        mut chain: Vec<Inode>,
        op_time_ms: i64,
    ) -> Result<()> {
        for i in 1..chain.len() {
            chain[i].parent_id = chain[i - 1].id;
        }
        let at = locked.path().ancestor(locked.existing_depth()).to_string();
        let parent = locked.deepest_mut()?;
        if !parent.is_directory() {
            return Err(MasterError::NotADirectory(at));
        }
        self.attach(&mut [parent], chain, op_time_ms).await
    }

    /// Insert `new` inodes, parents before children. The parent of each is
    /// either an earlier element of `new` or one of the write-locked
    /// `parents`; the parent gains the child link.
    pub async fn attach(
        &self,
        parents: &mut [&mut Inode],
        mut new: Vec<Inode>,
        op_time_ms: i64,
    ) -> Result<()> {
        let mut position: HashMap<InodeId, usize> = HashMap::with_capacity(new.len());
        for i in 0..new.len() {
            let (id, parent_id, name) = (new[i].id, new[i].parent_id, new[i].name.clone());
            let children = match position.get(&parent_id) {
                Some(&j) => new[j].as_directory_mut().map(|d| &mut d.children),
                None => {
                    let parent = parents
                        .iter_mut()
                        .find(|p| p.id == parent_id)
                        .ok_or_else(|| {
                            MasterError::Internal(format!(
                                "parent {parent_id} of new inode {id} is not locked"
                            ))
                        })?;
                    parent.touch(op_time_ms);
                    parent.as_directory_mut().map(|d| &mut d.children)
                }
            };
            let children = children.ok_or_else(|| {
                MasterError::NotADirectory(format!("parent {parent_id} of {name}"))
            })?;
            if children.contains_key(&name) {
                return Err(MasterError::AlreadyExists(name));
            }
            children.insert(name, id);
            position.insert(id, i);
        }
        let mut arena = self.inodes.write().await;
        for inode in new {
            self.observe_id(inode.id);
            arena.insert(inode.id, Arc::new(RwLock::new(inode)));
        }
        Ok(())
    }

    /// Unlink the target of `locked` (parent and target write locked) and
    /// drop it with its whole subtree. Returns the removed inodes.
    pub async fn remove_subtree(
        &self,
        locked: &mut LockedPath,
        op_time_ms: i64,
    ) -> Result<Vec<Inode>> {
        let target = locked.target()?.clone();
        let descendants = self.lock_descendants(&target, true).await?;
        let mut removed: Vec<Inode> = descendants.iter().map(|e| (*e.inode).clone()).collect();
        drop(descendants);
        {
            let parent = locked.parent_mut()?;
            if let Some(dir) = parent.as_directory_mut() {
                dir.children.remove(&target.name);
            }
            parent.touch(op_time_ms);
        }
        removed.insert(0, target);
        let mut arena = self.inodes.write().await;
        for inode in &removed {
            arena.remove(&inode.id);
        }
        Ok(removed)
    }

    /// Drop specific descendants of a held subtree. `ids` must be closed
    /// under descent (no child kept whose parent is dropped); parents that
    /// stay lose the links.
    pub async fn remove_ids(
        &self,
        kept_parents: &mut [SubtreeEntry],
        top: &mut Inode,
        ids: &HashSet<InodeId>,
    ) -> Result<()> {
        if let Some(dir) = top.as_directory_mut() {
            dir.children.retain(|_, id| !ids.contains(id));
        }
        for entry in kept_parents.iter_mut() {
            if ids.contains(&entry.inode.id) {
                continue;
            }
            let inode = entry.inode.get_mut()?;
            if let Some(dir) = inode.as_directory_mut() {
                dir.children.retain(|_, id| !ids.contains(id));
            }
        }
        let mut arena = self.inodes.write().await;
        for id in ids {
            arena.remove(id);
        }
        Ok(())
    }

    /// Move the source of a locked pair under the destination parent.
    pub fn move_inode(&self, pair: &mut LockedPair, op_time_ms: i64) -> Result<()> {
        let src_name = pair
            .src()
            .name()
            .ok_or_else(|| MasterError::invalid_path("/", "cannot rename the root"))?
            .to_string();
        let dst_name = pair
            .dst()
            .name()
            .ok_or_else(|| MasterError::invalid_path("/", "cannot rename onto the root"))?
            .to_string();
        let id = pair
            .src_target()
            .ok_or_else(|| MasterError::PathNotFound(pair.src().to_string()))?
            .id;
        {
            let src_parent = pair.src_parent_mut()?;
            if let Some(dir) = src_parent.as_directory_mut() {
                dir.children.remove(&src_name);
            }
            src_parent.touch(op_time_ms);
        }
        let dst_parent_id = {
            let dst_parent = pair.dst_parent_mut()?;
            let dir = dst_parent
                .as_directory_mut()
                .ok_or_else(|| MasterError::NotADirectory(dst_name.clone()))?;
            dir.children.insert(dst_name.clone(), id);
            dst_parent.touch(op_time_ms);
            dst_parent.id
        };
        let inode = pair.src_target_mut()?;
        inode.name = dst_name;
        inode.parent_id = dst_parent_id;
        inode.touch(op_time_ms);
        Ok(())
    }

    /// Copy of every inode, ordered by id.
    pub async fn snapshot(&self) -> Vec<Inode> {
        let cells: Vec<InodeCell> = self.inodes.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(cells.len());
        for cell in cells {
            out.push(cell.read().await.clone());
        }
        out.sort_by_key(|i| i.id);
        out
    }

    pub async fn validate(&self) -> Result<(), String> {
        check_invariants(&self.snapshot().await)
    }
}

/// Tree invariants: exactly one self-parented root, every other inode has
/// one directory parent that links it under its name, names are unique per
/// parent (guaranteed by the map) and everything is reachable from the root.
pub fn check_invariants(inodes: &[Inode]) -> Result<(), String> {
    let by_id: HashMap<InodeId, &Inode> = inodes.iter().map(|i| (i.id, i)).collect();
    if by_id.len() != inodes.len() {
        return Err("duplicate inode ids".into());
    }
    let root = by_id
        .get(&ROOT_INODE_ID)
        .ok_or_else(|| "root inode missing".to_string())?;
    if root.parent_id != ROOT_INODE_ID || !root.is_directory() {
        return Err("root must be a self-parented directory".into());
    }
    let mut linked: HashSet<InodeId> = HashSet::new();
    for inode in inodes {
        let Some(dir) = inode.as_directory() else {
            continue;
        };
        for (name, child_id) in &dir.children {
            let child = by_id
                .get(child_id)
                .ok_or_else(|| format!("{} links missing child {child_id}", inode.id))?;
            if child.parent_id != inode.id || &child.name != name {
                return Err(format!("child {child_id} of {} has a bad back link", inode.id));
            }
            if !linked.insert(*child_id) {
                return Err(format!("inode {child_id} has more than one parent"));
            }
        }
    }
    let mut reached = HashSet::from([ROOT_INODE_ID]);
    let mut stack = vec![ROOT_INODE_ID];
    while let Some(id) = stack.pop() {
        if let Some(dir) = by_id.get(&id).and_then(|i| i.as_directory()) {
            for child in dir.children.values() {
                if reached.insert(*child) {
                    stack.push(*child);
                }
            }
        }
    }
    if reached.len() != inodes.len() {
        return Err(format!(
            "{} inodes unreachable from the root",
            inodes.len() - reached.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PersistType;
    use std::time::Duration;

    fn tree() -> InodeTree {
        InodeTree::new(Inode::root("root", 0))
    }

    fn p(s: &str) -> NsPath {
        NsPath::new(s).unwrap()
    }

    async fn mkdir(tree: &InodeTree, path: &str) -> InodeId {
        let path = p(path);
        let mut locked = tree.lock_for_create(&path).await.unwrap();
        let id = tree.allocate_id();
        let parent = locked.deepest().id;
        let dir = Inode::new_directory(id, parent, path.name().unwrap(), 1);
        tree.add_chain(&mut locked, vec![dir], 1).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_add_and_resolve() {
        let tree = tree();
        let a = mkdir(&tree, "/a").await;
        let b = mkdir(&tree, "/a/b").await;
        let locked = tree.lock_path(&p("/a/b"), LockPattern::Read).await.unwrap();
        assert!(locked.is_full());
        assert_eq!(locked.target().unwrap().id, b);
        assert_eq!(locked.parent().unwrap().id, a);
        drop(locked);

        let missing = tree.lock_path(&p("/a/x/y"), LockPattern::Read).await.unwrap();
        assert!(!missing.is_full());
        assert_eq!(missing.existing_depth(), 1);
        assert_eq!(missing.missing_segments(), &["x".to_string(), "y".to_string()]);
        drop(missing);

        assert_eq!(tree.path_of(b).await.unwrap(), p("/a/b"));
        tree.validate().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_chain_links_children() {
        let tree = tree();
        let path = p("/x/y/z");
        let mut locked = tree.lock_for_create(&path).await.unwrap();
        assert_eq!(locked.existing_depth(), 0);
        assert!(locked.deepest_is_write());
        let x = tree.allocate_id();
        let y = tree.allocate_id();
        let z = tree.allocate_id();
        let chain = vec![
            Inode::new_directory(x, ROOT_INODE_ID, "x", 5),
            Inode::new_directory(y, x, "y", 5),
            Inode::new_file(z, y, "z", 5, 1024, PersistType::MustCache),
        ];
        tree.add_chain(&mut locked, chain, 5).await.unwrap();
        drop(locked);
        assert_eq!(tree.path_of(z).await.unwrap(), path);
        tree.validate().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let tree = tree();
        mkdir(&tree, "/a").await;
        mkdir(&tree, "/a/b").await;
        mkdir(&tree, "/a/b/c").await;
        mkdir(&tree, "/keep").await;
        let mut locked = tree
            .lock_path(&p("/a"), LockPattern::WriteParent)
            .await
            .unwrap();
        let removed = tree.remove_subtree(&mut locked, 9).await.unwrap();
        drop(locked);
        assert_eq!(removed.len(), 3);
        assert_eq!(tree.len().await, 2);
        tree.validate().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_between_directories() {
        let tree = tree();
        mkdir(&tree, "/src").await;
        let f = mkdir(&tree, "/src/f").await;
        mkdir(&tree, "/dst").await;
        let mut pair = tree.lock_pair(&p("/src/f"), &p("/dst/g")).await.unwrap();
        assert!(pair.dst_target().is_none());
        tree.move_inode(&mut pair, 3).unwrap();
        drop(pair);
        assert_eq!(tree.path_of(f).await.unwrap(), p("/dst/g"));
        tree.validate().await.unwrap();

        let mut same = tree.lock_pair(&p("/dst/g"), &p("/dst/h")).await.unwrap();
        tree.move_inode(&mut same, 4).unwrap();
        drop(same);
        assert_eq!(tree.path_of(f).await.unwrap(), p("/dst/h"));
    }

    #[tokio::test]
    async fn test_pair_rejects_nested_paths() {
        let tree = tree();
        mkdir(&tree, "/a").await;
        assert!(tree.lock_pair(&p("/a"), &p("/a/b")).await.is_err());
    }

    #[tokio::test]
    async fn test_disjoint_writers_do_not_block() {
        let tree = Arc::new(tree());
        mkdir(&tree, "/l").await;
        mkdir(&tree, "/r").await;
        let held = tree
            .lock_path(&p("/l"), LockPattern::WriteInode)
            .await
            .unwrap();
        let other = tree.clone();
        let r = tokio::time::timeout(Duration::from_secs(1), async move {
            other
                .lock_path(&p("/r"), LockPattern::WriteInode)
                .await
                .map(|l| l.target().map(|i| i.id).ok())
        })
        .await;
        assert!(r.is_ok());
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            tree.lock_path(&p("/l"), LockPattern::Read),
        )
        .await;
        assert!(blocked.is_err());
        drop(held);
    }

    #[test]
    fn test_invariants_catch_orphans() {
        let root = Inode::root("root", 0);
        let orphan = Inode::new_directory(7, ROOT_INODE_ID, "o", 0);
        assert!(check_invariants(&[root.clone(), orphan]).is_err());
        assert!(check_invariants(&[root]).is_ok());
    }
}
