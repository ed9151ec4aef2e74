//! The capability set the namespace needs from an under file system.
//!
//! Paths handed to an [`UnderFileSystem`] are absolute within the location
//! the handle was created for, so `/` is the mount's UFS base.

mod local;
mod memory;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

pub use local::LocalUfs;
pub use memory::MemoryUfs;

pub const MEMORY_SCHEME: &str = "mem://";
pub const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UfsStatus {
    pub name: String,
    pub is_directory: bool,
    pub length: u64,
    pub modification_time_ms: i64,
}

#[async_trait]
pub trait UnderFileSystem: Send + Sync {
    /// `None` when nothing exists at `path`.
    async fn get_status(&self, path: &str) -> io::Result<Option<UfsStatus>>;

    /// Children of a directory in name order; `None` when `path` is not a
    /// directory.
    async fn list_status(&self, path: &str) -> io::Result<Option<Vec<UfsStatus>>>;

    /// Create a directory and any missing parents.
    async fn mkdirs(&self, path: &str) -> io::Result<()>;

    /// Write a whole file, creating parents and replacing existing content.
    async fn create_file(&self, path: &str, data: &[u8]) -> io::Result<()>;

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()>;

    /// Fails when `dst` exists or its parent does not.
    async fn rename(&self, src: &str, dst: &str) -> io::Result<()>;
}

pub trait UfsFactory: Send + Sync {
    fn create(
        &self,
        uri: &str,
        properties: &BTreeMap<String, String>,
    ) -> io::Result<Arc<dyn UnderFileSystem>>;
}

/// Canonical form of a UFS location used to compare mounts: scheme kept,
/// bare paths treated as `file://`, trailing separators removed.
pub fn normalize_uri(uri: &str) -> String {
    let uri = if uri.contains("://") {
        uri.to_string()
    } else {
        format!("{FILE_SCHEME}{uri}")
    };
    let (scheme, rest) = uri.split_at(uri.find("://").map(|i| i + 3).unwrap_or(0));
    let mut rest = rest.to_string();
    while rest.contains("//") {
        rest = rest.replace("//", "/");
    }
    let rest = rest.trim_end_matches('/');
    format!("{scheme}{rest}")
}

/// Whether one location encloses the other (or they are the same).
pub fn uri_overlaps(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_uri(a), normalize_uri(b));
    a == b || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

/// Builds handles for `mem://<store>/<path>` and `file://<path>` (or bare
/// absolute paths). Memory stores are created on first use and shared by
/// every handle naming them.
#[derive(Default)]
pub struct DefaultUfsFactory {
    stores: Mutex<HashMap<String, MemoryUfs>>,
}

impl DefaultUfsFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root view of the named memory store.
    pub fn memory_store(&self, name: &str) -> io::Result<MemoryUfs> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| io::Error::other("memory store registry poisoned"))?;
        Ok(stores.entry(name.to_string()).or_default().clone())
    }
}

impl UfsFactory for DefaultUfsFactory {
    fn create(
        &self,
        uri: &str,
        _properties: &BTreeMap<String, String>,
    ) -> io::Result<Arc<dyn UnderFileSystem>> {
        if let Some(rest) = uri.strip_prefix(MEMORY_SCHEME) {
            let (store, base) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            if store.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("memory location {uri} names no store"),
                ));
            }
            return Ok(Arc::new(self.memory_store(store)?.scoped(base)));
        }
        let local = uri.strip_prefix(FILE_SCHEME).unwrap_or(uri);
        if local.contains("://") || !local.starts_with('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported UFS location {uri}"),
            ));
        }
        Ok(Arc::new(LocalUfs::new(local)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_uri() {
        assert_eq!(normalize_uri("/tmp/x/"), "file:///tmp/x");
        assert_eq!(normalize_uri("mem://b//data/"), "mem://b/data");
        assert_eq!(normalize_uri("file:///tmp/x"), "file:///tmp/x");
    }

    #[test]
    fn test_overlap() {
        assert!(uri_overlaps("mem://b/data", "mem://b/data/"));
        assert!(uri_overlaps("mem://b/data", "mem://b/data/sub"));
        assert!(uri_overlaps("mem://b/data/sub", "mem://b/data"));
        assert!(!uri_overlaps("mem://b/data", "mem://b/database"));
        assert!(!uri_overlaps("mem://a/data", "mem://b/data"));
    }

    #[tokio::test]
    async fn test_factory_shares_memory_stores() {
        let factory = DefaultUfsFactory::new();
        let ufs = factory.create("mem://s/base", &BTreeMap::new()).unwrap();
        ufs.create_file("/f", b"abc").await.unwrap();
        let root = factory.memory_store("s").unwrap();
        let status = root.get_status("/base/f").await.unwrap().unwrap();
        assert_eq!(status.length, 3);
        assert!(factory.create("s3://bucket", &BTreeMap::new()).is_err());
        assert!(factory.create("relative/dir", &BTreeMap::new()).is_err());
    }
}
