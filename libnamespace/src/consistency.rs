//! Comparison of cached metadata with what UFS actually holds.
//!
//! The subtree is copied under read locks, then the locks are dropped and
//! every entry is checked against its UFS with a bounded number of calls in
//! flight. The tree is never modified.

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use common::{CheckConsistencyOptions, PersistenceState};

use crate::error::Result;
use crate::lock::LockPattern;
use crate::master::NamespaceMaster;
use crate::path::NsPath;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InconsistencyKind {
    /// Recorded as persisted but absent from UFS.
    MissingInUfs,
    /// In UFS but not in the namespace below a loaded directory, or present
    /// for an entry that was never persisted.
    UnexpectedInUfs,
    /// A file on one side and a directory on the other.
    KindMismatch,
    LengthMismatch { expected: u64, found: u64 },
    /// UFS could not be asked about this entry.
    CheckFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inconsistency {
    pub path: String,
    pub kind: InconsistencyKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Depth first, parents before children.
    pub issues: Vec<Inconsistency>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    /// Inconsistent paths in report order, each once.
    pub fn paths(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for issue in &self.issues {
            if !out.contains(&issue.path) {
                out.push(issue.path.clone());
            }
        }
        out
    }
}

/// What the namespace believed about one entry when the check started.
struct Expected {
    path: NsPath,
    /// Persisted entries must exist in UFS, unpersisted ones must not.
    persisted: bool,
    is_directory: bool,
    /// Only for completed files.
    length: Option<u64>,
    /// Children names, when UFS children are expected to be mirrored.
    children: Option<BTreeSet<String>>,
}

impl NamespaceMaster {
    pub async fn check_consistency(
        &self,
        path: &NsPath,
        options: &CheckConsistencyOptions,
    ) -> Result<ConsistencyReport> {
        let expected = self.expected_state(path).await?;
        let limit = options
            .max_concurrency
            .unwrap_or(self.config.consistency.max_concurrency)
            .max(1);
        debug!(
            "checking {} entries under {path}, {limit} at a time",
            expected.len()
        );
        let results: Vec<Vec<Inconsistency>> = stream::iter(expected)
            .map(|entry| async move { self.check_entry(entry).await })
            .buffered(limit)
            .collect()
            .await;
        let report = ConsistencyReport {
            issues: results.into_iter().flatten().collect(),
        };
        if !report.is_consistent() {
            warn!("{path}: {} inconsistencies with UFS", report.issues.len());
        }
        Ok(report)
    }

    /// Entries of the subtree at `path` with a UFS expectation, in
    /// depth-first order. Files waiting for persistence have none.
    async fn expected_state(&self, path: &NsPath) -> Result<Vec<Expected>> {
        let locked = self.tree.lock_path(path, LockPattern::Read).await?;
        let target = locked.target()?;
        let subtree = if target.is_directory() {
            self.tree.lock_descendants(target, false).await?
        } else {
            Vec::new()
        };
        let mut entries = vec![(path.clone(), target)];
        entries.extend(subtree.iter().map(|e| (e.path_under(path), &*e.inode)));
        Ok(entries
            .into_iter()
            .filter(|(_, inode)| inode.persistence_state != PersistenceState::ToBePersisted)
            .map(|(path, inode)| Expected {
                path,
                persisted: inode.is_persisted(),
                is_directory: inode.is_directory(),
                length: inode
                    .as_file()
                    .filter(|f| f.completed)
                    .map(|f| f.length),
                children: inode
                    .as_directory()
                    .filter(|d| d.direct_children_loaded)
                    .map(|d| d.children.keys().cloned().collect()),
            })
            .collect())
    }

    async fn check_entry(&self, entry: Expected) -> Vec<Inconsistency> {
        let issue = |path: &NsPath, kind| Inconsistency {
            path: path.to_string(),
            kind,
        };
        let failed = |e: &dyn std::fmt::Display| {
            vec![issue(&entry.path, InconsistencyKind::CheckFailed(e.to_string()))]
        };
        let res = match self.mounts.resolve(&entry.path).await {
            Ok(res) => res,
            Err(e) => return failed(&e),
        };
        let status = match res.ufs.get_status(&res.ufs_path).await {
            Ok(Some(_)) if !entry.persisted => {
                return vec![issue(&entry.path, InconsistencyKind::UnexpectedInUfs)];
            }
            Ok(None) if !entry.persisted => return Vec::new(),
            Ok(Some(status)) => status,
            Ok(None) => return vec![issue(&entry.path, InconsistencyKind::MissingInUfs)],
            Err(e) => return failed(&e),
        };
        if status.is_directory != entry.is_directory {
            return vec![issue(&entry.path, InconsistencyKind::KindMismatch)];
        }
        let mut out = Vec::new();
        if let Some(expected) = entry.length {
            if expected != status.length {
                out.push(issue(
                    &entry.path,
                    InconsistencyKind::LengthMismatch {
                        expected,
                        found: status.length,
                    },
                ));
            }
        }
        let Some(known) = entry.children else {
            return out;
        };
        let listing = match res.ufs.list_status(&res.ufs_path).await {
            Ok(listing) => listing.unwrap_or_default(),
            Err(e) => return failed(&e),
        };
        let mut extra: Vec<String> = listing
            .into_iter()
            .map(|s| s.name)
            .filter(|name| !known.contains(name))
            .collect();
        extra.sort();
        for name in extra {
            match entry.path.join(&name) {
                Ok(child) => out.push(issue(&child, InconsistencyKind::UnexpectedInUfs)),
                Err(e) => debug!("ignoring UFS entry {name:?} under {}: {e}", entry.path),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(path: &str, kind: InconsistencyKind) -> Inconsistency {
        Inconsistency {
            path: path.to_string(),
            kind,
        }
    }

    #[test]
    fn test_paths_deduplicated_in_order() {
        let report = ConsistencyReport {
            issues: vec![
                issue("/a", InconsistencyKind::KindMismatch),
                issue("/a/b", InconsistencyKind::MissingInUfs),
                issue(
                    "/a/b",
                    InconsistencyKind::LengthMismatch {
                        expected: 1,
                        found: 2,
                    },
                ),
                issue("/a/c", InconsistencyKind::UnexpectedInUfs),
            ],
        };
        assert_eq!(report.paths(), vec!["/a", "/a/b", "/a/c"]);
        assert!(!report.is_consistent());
        assert!(ConsistencyReport::default().is_consistent());
    }
}
