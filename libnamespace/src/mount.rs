//! The mount table: namespace prefixes bound to UFS locations.
//!
//! Resolution is longest-prefix over the mounted paths; `/` is always
//! mounted. The whole table sits behind one lock. Callers holding inode
//! locks may take it, never the other way round.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use common::MountOptions;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{MasterError, Result};
use crate::path::{NsPath, join_ufs};
use crate::ufs::{UnderFileSystem, normalize_uri, uri_overlaps};

pub const ROOT_MOUNT_ID: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u64,
    pub path: String,
    pub ufs_uri: String,
    pub options: MountOptions,
}

struct Mounted {
    entry: MountEntry,
    ufs: Arc<dyn UnderFileSystem>,
}

/// Where a namespace path lives in UFS.
#[derive(Clone)]
pub struct Resolution {
    pub mount_id: u64,
    pub mount_path: NsPath,
    pub ufs_uri: String,
    pub read_only: bool,
    pub ufs: Arc<dyn UnderFileSystem>,
    /// Path within the mount's UFS handle.
    pub ufs_path: String,
}

impl Resolution {
    /// The location as an operator would write it.
    pub fn full_ufs_path(&self) -> String {
        let rel: Vec<String> = self
            .ufs_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if rel.is_empty() {
            return self.ufs_uri.clone();
        }
        format!("{}/{}", self.ufs_uri.trim_end_matches('/'), rel.join("/"))
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("mount_id", &self.mount_id)
            .field("mount_path", &self.mount_path)
            .field("ufs_uri", &self.ufs_uri)
            .field("ufs_path", &self.ufs_path)
            .finish()
    }
}

struct Inner {
    mounts: BTreeMap<NsPath, Mounted>,
    next_mount_id: u64,
}

pub struct MountTable {
    inner: RwLock<Inner>,
}

impl MountTable {
    pub fn new(root_uri: &str, options: MountOptions, ufs: Arc<dyn UnderFileSystem>) -> Self {
        let mut mounts = BTreeMap::new();
        mounts.insert(
            NsPath::root(),
            Mounted {
                entry: MountEntry {
                    mount_id: ROOT_MOUNT_ID,
                    path: "/".to_string(),
                    ufs_uri: root_uri.to_string(),
                    options,
                },
                ufs,
            },
        );
        Self {
            inner: RwLock::new(Inner {
                mounts,
                next_mount_id: ROOT_MOUNT_ID + 1,
            }),
        }
    }

    pub async fn resolve(&self, path: &NsPath) -> Result<Resolution> {
        let inner = self.inner.read().await;
        for depth in (0..=path.depth()).rev() {
            let prefix = path.ancestor(depth);
            if let Some(m) = inner.mounts.get(&prefix) {
                return Ok(Resolution {
                    mount_id: m.entry.mount_id,
                    mount_path: prefix,
                    ufs_uri: m.entry.ufs_uri.clone(),
                    read_only: m.entry.options.read_only,
                    ufs: m.ufs.clone(),
                    ufs_path: join_ufs("/", &path.segments()[depth..]),
                });
            }
        }
        Err(MasterError::Internal("root mount missing".into()))
    }

    pub async fn next_mount_id(&self) -> u64 {
        self.inner.read().await.next_mount_id
    }

    /// Reject a mount that would shadow or overlap an existing one.
    pub async fn check_add(&self, path: &NsPath, ufs_uri: &str) -> Result<()> {
        let inner = self.inner.read().await;
        Self::check_conflicts(&inner, path, ufs_uri)
    }

    /// Reject a UFS address that overlaps one already mounted.
    pub async fn check_uri(&self, ufs_uri: &str) -> Result<()> {
        let inner = self.inner.read().await;
        Self::check_uri_overlap(&inner, ufs_uri)
    }

    fn check_conflicts(inner: &Inner, path: &NsPath, ufs_uri: &str) -> Result<()> {
        if inner.mounts.contains_key(path) {
            return Err(MasterError::MountConflict(format!("{path} is already a mount point")));
        }
        Self::check_uri_overlap(inner, ufs_uri)
    }

    fn check_uri_overlap(inner: &Inner, ufs_uri: &str) -> Result<()> {
        for (at, m) in &inner.mounts {
            if uri_overlaps(&m.entry.ufs_uri, ufs_uri) {
                return Err(MasterError::MountConflict(format!(
                    "{} overlaps {} mounted at {at}",
                    normalize_uri(ufs_uri),
                    normalize_uri(&m.entry.ufs_uri)
                )));
            }
        }
        Ok(())
    }

    pub async fn add(&self, entry: MountEntry, ufs: Arc<dyn UnderFileSystem>) -> Result<()> {
        let path = NsPath::new(&entry.path)?;
        let mut inner = self.inner.write().await;
        Self::check_conflicts(&inner, &path, &entry.ufs_uri)?;
        inner.next_mount_id = inner.next_mount_id.max(entry.mount_id + 1);
        info!("mounted {} at {}", entry.ufs_uri, path);
        inner.mounts.insert(path, Mounted { entry, ufs });
        Ok(())
    }

    pub async fn remove(&self, path: &NsPath) -> Result<MountEntry> {
        if path.is_root() {
            return Err(MasterError::invalid_path("/", "the root mount cannot be removed"));
        }
        let mut inner = self.inner.write().await;
        let m = inner
            .mounts
            .remove(path)
            .ok_or_else(|| MasterError::invalid_path(path.to_string(), "not a mount point"))?;
        info!("unmounted {} from {}", m.entry.ufs_uri, path);
        Ok(m.entry)
    }

    pub async fn get(&self, path: &NsPath) -> Option<MountEntry> {
        self.inner
            .read()
            .await
            .mounts
            .get(path)
            .map(|m| m.entry.clone())
    }

    /// Mounts strictly below `path`.
    pub async fn mounts_under(&self, path: &NsPath) -> Vec<MountEntry> {
        self.inner
            .read()
            .await
            .mounts
            .iter()
            .filter(|(at, _)| path.is_ancestor_of(at))
            .map(|(_, m)| m.entry.clone())
            .collect()
    }

    /// Every mount, root first, in path order.
    pub async fn list(&self) -> Vec<MountEntry> {
        self.inner
            .read()
            .await
            .mounts
            .values()
            .map(|m| m.entry.clone())
            .collect()
    }

    pub async fn root(&self) -> Option<MountEntry> {
        self.get(&NsPath::root()).await
    }
}
