#![allow(dead_code)]

use std::sync::Arc;

use libnamespace::{
    DefaultUfsFactory, MasterConfig, MemoryDataPlane, MemoryUfs, NamespaceMaster, NsPath,
};
use tempfile::TempDir;

pub const BLOCK: u64 = 64 * 1024 * 1024;

pub fn p(path: &str) -> NsPath {
    NsPath::new(path).unwrap()
}

pub struct Fixture {
    pub dir: TempDir,
    pub factory: Arc<DefaultUfsFactory>,
    pub data: Arc<MemoryDataPlane>,
    pub config: MasterConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = MasterConfig::default();
        config.journal_dir = dir.path().join("journal");
        config.cache_dir = dir.path().join("cache");
        config.root_ufs = "mem://root".to_string();
        config.persistence.workers = 2;
        config.persistence.max_attempts = 3;
        config.persistence.initial_backoff_ms = 5;
        config.persistence.max_backoff_ms = 20;
        Self {
            dir,
            factory: Arc::new(DefaultUfsFactory::new()),
            data: Arc::new(MemoryDataPlane::new()),
            config,
        }
    }

    pub async fn open(&self) -> Arc<NamespaceMaster> {
        NamespaceMaster::open(self.config.clone(), self.factory.clone(), self.data.clone())
            .await
            .unwrap()
    }

    /// View of a memory store, the root mount's by default.
    pub fn store(&self, name: &str) -> MemoryUfs {
        self.factory.memory_store(name).unwrap()
    }

    pub fn root_ufs(&self) -> MemoryUfs {
        self.store("root")
    }
}
