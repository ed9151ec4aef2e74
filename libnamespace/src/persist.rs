//! Asynchronous persistence of cached files to their UFS.
//!
//! Files move NotPersisted -> ToBePersisted -> Persisted. A file id sits in
//! the queue at most once, from enqueue until its worker finishes with it,
//! so there is never more than one write in flight per file. The data copy
//! runs with no inode lock held; the result is committed afterwards only if
//! the file is still where it was when the copy started.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use common::{InodeId, PersistenceState};

use crate::error::{MasterError, Result};
use crate::journal::{JournalOp, PersistStateOp};
use crate::lock::LockPattern;
use crate::master::{NamespaceMaster, now_ms, unpersisted_ancestors};
use crate::path::NsPath;

/// A file that ran out of persistence attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistFailure {
    pub id: InodeId,
    pub path: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<InodeId>,
    /// Pending or being worked on.
    scheduled: HashSet<InodeId>,
    failures: HashMap<InodeId, PersistFailure>,
}

#[derive(Default)]
pub struct PersistQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl PersistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Queue `id` unless it is already queued or in flight.
    pub fn enqueue(&self, id: InodeId) -> bool {
        let added = self.with_state(|s| {
            if !s.scheduled.insert(id) {
                return false;
            }
            s.pending.push_back(id);
            true
        });
        if added {
            self.ready.notify_one();
        }
        added
    }

    pub fn is_scheduled(&self, id: InodeId) -> bool {
        self.with_state(|s| s.scheduled.contains(&id))
    }

    pub fn pending(&self) -> usize {
        self.with_state(|s| s.pending.len())
    }

    fn take(&self) -> Option<InodeId> {
        self.with_state(|s| s.pending.pop_front())
    }

    /// Wait for the next queued file; `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<InodeId> {
        loop {
            if let Some(id) = self.take() {
                return Some(id);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.ready.notified() => {}
            }
        }
    }

    pub fn finish(&self, id: InodeId) {
        self.with_state(|s| {
            s.scheduled.remove(&id);
        });
    }

    pub fn record_failure(&self, failure: PersistFailure) {
        self.with_state(|s| {
            s.failures.insert(failure.id, failure);
        });
    }

    pub fn clear_failure(&self, id: InodeId) {
        self.with_state(|s| {
            s.failures.remove(&id);
        });
    }

    pub fn failed(&self) -> Vec<PersistFailure> {
        let mut out: Vec<PersistFailure> = self.with_state(|s| s.failures.values().cloned().collect());
        out.sort_by_key(|f| f.id);
        out
    }
}

/// Delay before retry number `attempt` (1-based), doubling up to `max_ms`.
pub fn backoff(initial_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PersistOutcome {
    Persisted,
    /// No longer waiting for persistence, or gone.
    Skipped,
    /// Renamed or replaced while the data was copied.
    Moved,
}

pub(crate) async fn run_worker(
    master: Arc<NamespaceMaster>,
    worker: usize,
    cancel: CancellationToken,
) {
    debug!("persistence worker {worker} started");
    while let Some(id) = master.persist.next(&cancel).await {
        let failure = master.persist_with_retry(id, &cancel).await;
        master.persist.finish(id);
        if let Some(failure) = failure {
            master.persist.record_failure(failure);
        }
        if master.is_halted() {
            break;
        }
    }
    debug!("persistence worker {worker} stopped");
}

fn retryable(e: &MasterError) -> bool {
    matches!(e, MasterError::UfsIo { .. })
}

impl NamespaceMaster {
    /// Persist `id`, retrying UFS failures with backoff. Returns the failure
    /// to record when every attempt was used up.
    pub(crate) async fn persist_with_retry(
        &self,
        id: InodeId,
        cancel: &CancellationToken,
    ) -> Option<PersistFailure> {
        let policy = self.config.persistence.clone();
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.persist_once(id).await {
                Ok(PersistOutcome::Persisted) => {
                    self.persist.clear_failure(id);
                    return None;
                }
                Ok(PersistOutcome::Skipped) => return None,
                Ok(PersistOutcome::Moved) => {
                    debug!("inode {id} moved during persistence, retrying");
                    last_error = "moved during persistence".to_string();
                    continue;
                }
                Err(e) if retryable(&e) && attempt < max_attempts => {
                    let delay = backoff(policy.initial_backoff_ms, policy.max_backoff_ms, attempt);
                    warn!("persisting inode {id} failed (attempt {attempt}): {e}, retrying in {delay:?}");
                    last_error = e.to_string();
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if retryable(&e) => last_error = e.to_string(),
                Err(e) => {
                    error!("persisting inode {id} failed: {e}");
                    last_error = e.to_string();
                    break;
                }
            }
        }
        if self.is_halted() {
            return None;
        }
        match self.abandon_persist(id).await {
            Ok(Some(path)) => {
                error!("giving up on persisting {path} after {max_attempts} attempts: {last_error}");
                Some(PersistFailure {
                    id,
                    path: path.to_string(),
                    attempts: max_attempts,
                    error: last_error,
                })
            }
            Ok(None) => None,
            Err(e) => {
                error!("could not reset persistence state of inode {id}: {e}");
                None
            }
        }
    }

    /// One attempt at copying a cached file to its UFS.
    pub(crate) async fn persist_once(&self, id: InodeId) -> Result<PersistOutcome> {
        let Some(path) = self.tree.path_of(id).await else {
            return Ok(PersistOutcome::Skipped);
        };
        let (blocks, length) = {
            let locked = self.tree.lock_path(&path, LockPattern::Read).await?;
            let Ok(target) = locked.target() else {
                return Ok(PersistOutcome::Moved);
            };
            if target.id != id {
                return Ok(PersistOutcome::Moved);
            }
            let Some(file) = target.as_file() else {
                return Ok(PersistOutcome::Skipped);
            };
            if target.persistence_state != PersistenceState::ToBePersisted || !file.completed {
                return Ok(PersistOutcome::Skipped);
            }
            (file.block_ids.clone(), file.length)
        };
        let res = self.mounts.resolve(&path).await?;
        if res.read_only {
            return Err(MasterError::PermissionDenied(format!(
                "{path} is under a read-only mount"
            )));
        }
        let data = self
            .data_plane
            .read_file(id, &blocks, length)
            .await
            .map_err(|e| MasterError::ufs(path.to_string(), e))?;
        res.ufs
            .create_file(&res.ufs_path, &data)
            .await
            .map_err(|e| MasterError::ufs(path.to_string(), e))?;

        let _gate = self.begin_mutation().await?;
        let mut locked = self
            .lock_widening(&path, path.depth(), false, |l| {
                unpersisted_ancestors(l).first().map(|(d, _)| *d)
            })
            .await?;
        let unchanged = locked.target().is_ok_and(|t| {
            t.id == id && t.persistence_state == PersistenceState::ToBePersisted
        });
        if !unchanged {
            drop(locked);
            // the copy landed where the file no longer is
            if let Err(e) = res.ufs.delete(&res.ufs_path, false).await {
                debug!("removing stale copy of inode {id} at {path}: {e}");
            }
            return Ok(if self.tree.path_of(id).await.is_some() {
                PersistOutcome::Moved
            } else {
                PersistOutcome::Skipped
            });
        }
        let op = PersistStateOp {
            path: path.to_string(),
            id,
            state: PersistenceState::Persisted,
            persist_ancestors: unpersisted_ancestors(&locked)
                .into_iter()
                .map(|(_, id)| id)
                .collect(),
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::PersistState(op.clone())).await?;
        self.apply_persist_state(&mut locked, &op)?;
        info!("persisted {path} ({length} bytes)");
        Ok(PersistOutcome::Persisted)
    }

    /// Return a file that could not be persisted to NotPersisted.
    async fn abandon_persist(&self, id: InodeId) -> Result<Option<NsPath>> {
        let Some(path) = self.tree.path_of(id).await else {
            return Ok(None);
        };
        let _gate = self.begin_mutation().await?;
        let mut locked = self.tree.lock_path_from(&path, path.depth()).await?;
        let waiting = locked.target().is_ok_and(|t| {
            t.id == id && t.persistence_state == PersistenceState::ToBePersisted
        });
        if !waiting {
            return Ok(None);
        }
        let op = PersistStateOp {
            path: path.to_string(),
            id,
            state: PersistenceState::NotPersisted,
            persist_ancestors: Vec::new(),
            op_time_ms: now_ms(),
        };
        self.journal(&JournalOp::PersistState(op.clone())).await?;
        self.apply_persist_state(&mut locked, &op)?;
        Ok(Some(path))
    }

    /// Files whose persistence was abandoned, until they are rescheduled.
    pub fn persist_failures(&self) -> Vec<PersistFailure> {
        self.persist.failed()
    }

    /// Files queued but not yet picked up by a worker.
    pub fn persist_backlog(&self) -> usize {
        self.persist.pending()
    }
}
