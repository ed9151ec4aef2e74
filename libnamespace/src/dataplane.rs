//! Access to cached file bytes held outside the master.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use common::{BlockId, InodeId};

#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Cached content of a completed file.
    async fn read_file(&self, file_id: InodeId, block_ids: &[BlockId], length: u64)
    -> io::Result<Vec<u8>>;

    /// Drop cached copies of the given blocks. Best effort.
    async fn evict(&self, block_ids: &[BlockId]) -> io::Result<()>;
}

/// Holds file content keyed by inode id.
#[derive(Default)]
pub struct MemoryDataPlane {
    files: Mutex<HashMap<InodeId, Vec<u8>>>,
    evicted: Mutex<Vec<BlockId>>,
}

impl MemoryDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, file_id: InodeId, data: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(file_id, data);
        }
    }

    pub fn evicted(&self) -> Vec<BlockId> {
        self.evicted.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DataPlane for MemoryDataPlane {
    async fn read_file(
        &self,
        file_id: InodeId,
        _block_ids: &[BlockId],
        length: u64,
    ) -> io::Result<Vec<u8>> {
        let files = self
            .files
            .lock()
            .map_err(|_| io::Error::other("data plane poisoned"))?;
        match files.get(&file_id) {
            Some(data) => Ok(data.clone()),
            // empty files have nothing cached
            None if length == 0 => Ok(Vec::new()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no cached data for file {file_id}"),
            )),
        }
    }

    async fn evict(&self, block_ids: &[BlockId]) -> io::Result<()> {
        let mut evicted = self
            .evicted
            .lock()
            .map_err(|_| io::Error::other("data plane poisoned"))?;
        evicted.extend_from_slice(block_ids);
        Ok(())
    }
}

/// Reads cached content from `<dir>/<file_id>`.
pub struct DirDataPlane {
    dir: PathBuf,
}

impl DirDataPlane {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DataPlane for DirDataPlane {
    async fn read_file(
        &self,
        file_id: InodeId,
        _block_ids: &[BlockId],
        length: u64,
    ) -> io::Result<Vec<u8>> {
        let data = tokio::fs::read(self.dir.join(file_id.to_string())).await?;
        if data.len() as u64 != length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "cached file {file_id} has {} bytes, expected {length}",
                    data.len()
                ),
            ));
        }
        Ok(data)
    }

    async fn evict(&self, _block_ids: &[BlockId]) -> io::Result<()> {
        // the directory is managed by the workers that wrote it
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_plane() {
        let plane = MemoryDataPlane::new();
        plane.put(4, b"abc".to_vec());
        assert_eq!(plane.read_file(4, &[], 3).await.unwrap(), b"abc");
        assert!(plane.read_file(5, &[], 10).await.is_err());
        assert!(plane.read_file(5, &[], 0).await.unwrap().is_empty());
        plane.evict(&[1, 2]).await.unwrap();
        assert_eq!(plane.evicted(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_dir_plane_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("9"), b"12345").await.unwrap();
        let plane = DirDataPlane::new(dir.path());
        assert_eq!(plane.read_file(9, &[], 5).await.unwrap().len(), 5);
        assert!(plane.read_file(9, &[], 4).await.is_err());
    }
}
