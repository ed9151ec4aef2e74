//! The namespace master: every public operation of the namespace.
//!
//! A mutation validates under path locks, performs its UFS side effect,
//! appends exactly one journal entry and applies that entry to the locked
//! inodes before the locks are released. A failed append halts all further
//! mutations. Replay applies the same entries through the same code.

mod apply;
mod mounts;
mod namespace;

pub(crate) use apply::unpersisted_ancestors;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{InodeId, PersistenceState};

use crate::block::BlockAllocator;
use crate::config::MasterConfig;
use crate::dataplane::DataPlane;
use crate::error::{MasterError, Result};
use crate::inode::Inode;
use crate::journal::{Checkpoint, Journal, JournalError, JournalOp};
use crate::lock::LockedPath;
use crate::mount::{MountTable, ROOT_MOUNT_ID};
use crate::path::NsPath;
use crate::persist::{self, PersistQueue};
use crate::tree::InodeTree;
use crate::ufs::UfsFactory;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct NamespaceMaster {
    pub(crate) config: MasterConfig,
    pub(crate) tree: InodeTree,
    pub(crate) mounts: MountTable,
    pub(crate) blocks: BlockAllocator,
    pub(crate) journal: Journal,
    pub(crate) persist: PersistQueue,
    pub(crate) ufs_factory: Arc<dyn UfsFactory>,
    pub(crate) data_plane: Arc<dyn DataPlane>,
    /// Held shared by mutations, exclusively by checkpoints.
    gate: RwLock<()>,
    /// Serialises mount table changes; taken after inode locks.
    mount_lock: Mutex<()>,
    halted: AtomicBool,
    checkpoint_wanted: Notify,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NamespaceMaster {
    /// Recover the namespace from `config.journal_dir`: load the latest
    /// checkpoint, replay the entries after it and re-queue every file that
    /// was waiting for persistence.
    pub async fn open(
        config: MasterConfig,
        ufs_factory: Arc<dyn UfsFactory>,
        data_plane: Arc<dyn DataPlane>,
    ) -> Result<Arc<Self>> {
        let (journal, recovered) = Journal::open(&config.journal_dir).await?;
        let root_ufs = ufs_factory
            .create(&config.root_ufs, &config.root_mount.properties)
            .map_err(|e| MasterError::ufs(config.root_ufs.clone(), e))?;
        let mounts = MountTable::new(&config.root_ufs, config.root_mount.clone(), root_ufs);

        let (tree, blocks) = match recovered.checkpoint {
            Some(cp) => {
                for entry in cp.mounts {
                    let ufs = ufs_factory
                        .create(&entry.ufs_uri, &entry.options.properties)
                        .map_err(|e| MasterError::ufs(entry.ufs_uri.clone(), e))?;
                    mounts.add(entry, ufs).await?;
                }
                let tree = InodeTree::restore(cp.inodes, cp.next_inode_id)
                    .map_err(|e| JournalError::ReplayMismatch(format!("bad checkpoint: {e}")))?;
                (tree, BlockAllocator::new(cp.next_block_id))
            }
            None => (
                InodeTree::new(Inode::root("", 0)),
                BlockAllocator::default(),
            ),
        };

        let master = Arc::new(Self {
            persist: PersistQueue::new(),
            config,
            tree,
            mounts,
            blocks,
            journal,
            ufs_factory,
            data_plane,
            gate: RwLock::new(()),
            mount_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
            checkpoint_wanted: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let replayed = recovered.entries.len();
        for entry in recovered.entries {
            master.replay(&entry.op).await.map_err(|e| {
                JournalError::ReplayMismatch(format!(
                    "entry {} ({}): {e}",
                    entry.sequence,
                    entry.op.name()
                ))
            })?;
        }

        let mut waiting = 0;
        for inode in master.tree.snapshot().await {
            if inode.is_file() && inode.persistence_state == PersistenceState::ToBePersisted {
                master.persist.enqueue(inode.id);
                waiting += 1;
            }
        }
        info!(
            "namespace recovered: {} inodes, {replayed} entries replayed, {waiting} files awaiting persistence",
            master.tree.len().await
        );
        Ok(master)
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            return Err(MasterError::Halted);
        }
        Ok(())
    }

    /// Shared hold on the checkpoint gate for one mutation.
    pub(crate) async fn begin_mutation(&self) -> Result<tokio::sync::RwLockReadGuard<'_, ()>> {
        self.ensure_running()?;
        Ok(self.gate.read().await)
    }

    pub(crate) async fn lock_mount_table(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mount_lock.lock().await
    }

    /// Append `op`, halting the master if the journal cannot take it.
    pub(crate) async fn journal(&self, op: &JournalOp) -> Result<u64> {
        self.ensure_running()?;
        match self.journal.append(op).await {
            Ok(seq) => {
                let threshold = self.config.journal.checkpoint_entries;
                if threshold > 0 && self.journal.entries_since_checkpoint().await >= threshold {
                    self.checkpoint_wanted.notify_one();
                }
                Ok(seq)
            }
            Err(e) => {
                self.halted.store(true, Ordering::SeqCst);
                error!(
                    "journal append of {} failed, refusing further mutations: {e}",
                    op.name()
                );
                Err(e.into())
            }
        }
    }

    /// Lock `path` writing from `write_from`, widening the write range until
    /// `needs_write` reports no read-locked inode that must change.
    pub(crate) async fn lock_widening<F>(
        &self,
        path: &NsPath,
        mut write_from: usize,
        create: bool,
        needs_write: F,
    ) -> Result<LockedPath>
    where
        F: Fn(&LockedPath) -> Option<usize>,
    {
        loop {
            let locked = if create {
                self.tree.lock_for_create_from(path, write_from).await?
            } else {
                self.tree.lock_path_from(path, write_from).await?
            };
            match needs_write(&locked) {
                Some(depth) if !locked.is_write_at(depth) => write_from = depth,
                _ => return Ok(locked),
            }
        }
    }

    /// Write a checkpoint of the current state while no mutation is in
    /// flight.
    pub async fn checkpoint(&self) -> Result<u64> {
        let _gate = self.gate.write().await;
        self.ensure_running()?;
        let last_sequence = self.journal.last_sequence().await;
        let mounts = self
            .mounts
            .list()
            .await
            .into_iter()
            .filter(|m| m.mount_id != ROOT_MOUNT_ID)
            .collect();
        let checkpoint = Checkpoint {
            last_sequence,
            next_inode_id: self.tree.next_id(),
            next_block_id: self.blocks.next_id(),
            inodes: self.tree.snapshot().await,
            mounts,
        };
        self.journal.write_checkpoint(&checkpoint).await?;
        Ok(last_sequence)
    }

    /// Spawn the persistence workers and the checkpoint trigger.
    pub fn start_background(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for worker in 0..self.config.persistence.workers.max(1) {
            handles.push(tokio::spawn(persist::run_worker(
                self.clone(),
                worker,
                self.cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(run_checkpointer(self.clone(), self.cancel.clone())));
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(_) => error!("background task registry poisoned"),
        }
    }

    /// Stop background work and write a final checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background task ended abnormally: {e}");
            }
        }
        if self.is_halted() {
            return Err(MasterError::Halted);
        }
        let seq = self.checkpoint().await?;
        info!("namespace master stopped at sequence {seq}");
        Ok(())
    }

    /// Copy of every inode, ordered by id, taken while no mutation runs.
    pub async fn inodes(&self) -> Vec<Inode> {
        let _gate = self.gate.write().await;
        self.tree.snapshot().await
    }

    /// Check the tree invariants over a quiescent copy.
    pub async fn validate_tree(&self) -> std::result::Result<(), String> {
        crate::tree::check_invariants(&self.inodes().await)
    }

    pub(crate) fn is_persist_scheduled(&self, id: InodeId) -> bool {
        self.persist.is_scheduled(id)
    }
}

async fn run_checkpointer(master: Arc<NamespaceMaster>, cancel: CancellationToken) {
    let secs = master.config.journal.checkpoint_interval_secs.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = master.checkpoint_wanted.notified() => {}
            _ = interval.tick() => {}
        }
        if master.is_halted() {
            break;
        }
        if master.journal.entries_since_checkpoint().await == 0 {
            continue;
        }
        if let Err(e) = master.checkpoint().await {
            error!("checkpoint failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::MemoryDataPlane;
    use crate::error::ErrorKind;
    use crate::ufs::DefaultUfsFactory;
    use common::{CreateDirectoryOptions, GetStatusOptions};

    async fn open_master(dir: &std::path::Path) -> Arc<NamespaceMaster> {
        let mut config = MasterConfig::default();
        config.journal_dir = dir.join("journal");
        config.cache_dir = dir.join("cache");
        config.root_ufs = "mem://root".to_string();
        NamespaceMaster::open(
            config,
            Arc::new(DefaultUfsFactory::new()),
            Arc::new(MemoryDataPlane::new()),
        )
        .await
        .unwrap()
    }

    fn path(s: &str) -> NsPath {
        NsPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_failed_append_halts_mutations() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let master = open_master(dir.path()).await;
        master
            .create_directory(&path("/kept"), &CreateDirectoryOptions::default())
            .await
            .unwrap();

        master.journal.fail_next_append();
        let err = master
            .create_directory(&path("/lost"), &CreateDirectoryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JournalWriteFailure);
        assert!(matches!(err, MasterError::Journal(_)));
        assert!(master.is_halted());

        let lost = master
            .get_status(&path("/lost"), &GetStatusOptions::default())
            .await;
        assert_eq!(lost.unwrap_err().kind(), ErrorKind::PathNotFound);
        assert_eq!(master.inodes().await.len(), 2);

        let err = master
            .create_directory(&path("/next"), &CreateDirectoryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::Halted));
        assert_eq!(err.kind(), ErrorKind::JournalWriteFailure);
        assert!(matches!(master.checkpoint().await, Err(MasterError::Halted)));
        assert!(matches!(master.shutdown().await, Err(MasterError::Halted)));
        drop(master);

        let reopened = open_master(dir.path()).await;
        assert!(!reopened.is_halted());
        let names: Vec<String> = reopened.inodes().await.into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["".to_string(), "kept".to_string()]);
    }
}
