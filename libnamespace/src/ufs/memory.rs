//! In-memory UFS with fault injection, for tests and embedding.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{UfsStatus, UnderFileSystem};

#[derive(Debug, Clone)]
enum Entry {
    Directory { mtime_ms: i64 },
    File { data: Vec<u8>, mtime_ms: i64 },
}

#[derive(Default)]
struct Store {
    entries: BTreeMap<String, Entry>,
    // path prefix -> remaining failures (None fails forever)
    faults: HashMap<String, Option<usize>>,
    calls: usize,
}

/// A view of a shared in-memory store rooted at some directory of it.
#[derive(Clone)]
pub struct MemoryUfs {
    store: Arc<Mutex<Store>>,
    root: String,
}

impl Default for MemoryUfs {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn normalize(path: &str) -> String {
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segs.join("/"))
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

fn name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}

fn is_under(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path} does not exist"))
}

impl Store {
    fn status(&self, path: &str) -> Option<UfsStatus> {
        let entry = self.entries.get(path)?;
        Some(match entry {
            Entry::Directory { mtime_ms } => UfsStatus {
                name: name_of(path),
                is_directory: true,
                length: 0,
                modification_time_ms: *mtime_ms,
            },
            Entry::File { data, mtime_ms } => UfsStatus {
                name: name_of(path),
                is_directory: false,
                length: data.len() as u64,
                modification_time_ms: *mtime_ms,
            },
        })
    }

    fn check_fault(&mut self, path: &str) -> io::Result<()> {
        self.calls += 1;
        let hit = self
            .faults
            .keys()
            .find(|p| p.as_str() == path || is_under(path, p))
            .cloned();
        let Some(key) = hit else {
            return Ok(());
        };
        let exhausted = match self.faults.get_mut(&key) {
            Some(Some(n)) => {
                *n -= 1;
                *n == 0
            }
            _ => false,
        };
        if exhausted {
            self.faults.remove(&key);
        }
        Err(io::Error::other(format!("injected failure at {path}")))
    }

    fn mkdirs(&mut self, path: &str) -> io::Result<()> {
        let mut missing = Vec::new();
        let mut cur = Some(path);
        while let Some(p) = cur {
            match self.entries.get(p) {
                Some(Entry::Directory { .. }) => break,
                Some(Entry::File { .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{p} is a file"),
                    ));
                }
                None => missing.push(p.to_string()),
            }
            cur = parent_of(p);
        }
        let now = now_ms();
        for p in missing {
            self.entries.insert(p, Entry::Directory { mtime_ms: now });
        }
        Ok(())
    }

    fn subtree_keys(&self, path: &str) -> Vec<String> {
        self.entries
            .range(path.to_string()..)
            .take_while(|(k, _)| k.as_str() == path || k.starts_with(path))
            .filter(|(k, _)| k.as_str() == path || is_under(k, path))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl MemoryUfs {
    pub fn new() -> Self {
        let mut store = Store::default();
        store
            .entries
            .insert("/".to_string(), Entry::Directory { mtime_ms: now_ms() });
        Self {
            store: Arc::new(Mutex::new(store)),
            root: "/".to_string(),
        }
    }

    /// A view of the same store rooted at `base`.
    pub fn scoped(&self, base: &str) -> Self {
        Self {
            store: self.store.clone(),
            root: self.absolute(base),
        }
    }

    fn absolute(&self, path: &str) -> String {
        normalize(&format!("{}/{}", self.root, path))
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| io::Error::other("memory ufs poisoned"))
    }

    /// Fail every call touching `path` or anything below it.
    pub fn fail_path(&self, path: &str) {
        if let Ok(mut store) = self.lock() {
            store.faults.insert(self.absolute(path), None);
        }
    }

    /// Fail the next `times` calls touching `path`.
    pub fn fail_path_times(&self, path: &str, times: usize) {
        if times == 0 {
            return;
        }
        if let Ok(mut store) = self.lock() {
            store.faults.insert(self.absolute(path), Some(times));
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut store) = self.lock() {
            store.faults.clear();
        }
    }

    /// Number of calls served so far, failures included.
    pub fn calls(&self) -> usize {
        self.lock().map(|s| s.calls).unwrap_or_default()
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        let store = self.lock().ok()?;
        match store.entries.get(&self.absolute(path)) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock()
            .map(|s| s.entries.contains_key(&self.absolute(path)))
            .unwrap_or(false)
    }
}

#[async_trait]
impl UnderFileSystem for MemoryUfs {
    async fn get_status(&self, path: &str) -> io::Result<Option<UfsStatus>> {
        let path = self.absolute(path);
        let mut store = self.lock()?;
        store.check_fault(&path)?;
        Ok(store.status(&path))
    }

    async fn list_status(&self, path: &str) -> io::Result<Option<Vec<UfsStatus>>> {
        let path = self.absolute(path);
        let mut store = self.lock()?;
        store.check_fault(&path)?;
        if !matches!(store.entries.get(&path), Some(Entry::Directory { .. })) {
            return Ok(None);
        }
        let children = store
            .entries
            .keys()
            .filter(|k| is_under(k, &path) && parent_of(k) == Some(path.as_str()))
            .filter_map(|k| store.status(k))
            .collect();
        Ok(Some(children))
    }

    async fn mkdirs(&self, path: &str) -> io::Result<()> {
        let path = self.absolute(path);
        let mut store = self.lock()?;
        store.check_fault(&path)?;
        store.mkdirs(&path)
    }

    async fn create_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let path = self.absolute(path);
        let mut store = self.lock()?;
        store.check_fault(&path)?;
        if matches!(store.entries.get(&path), Some(Entry::Directory { .. })) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path} is a directory"),
            ));
        }
        if let Some(parent) = parent_of(&path) {
            store.mkdirs(parent)?;
        }
        store.entries.insert(
            path,
            Entry::File {
                data: data.to_vec(),
                mtime_ms: now_ms(),
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()> {
        let path = self.absolute(path);
        let mut store = self.lock()?;
        store.check_fault(&path)?;
        if path == "/" {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cannot delete the store root",
            ));
        }
        if !store.entries.contains_key(&path) {
            return Err(not_found(&path));
        }
        let keys = store.subtree_keys(&path);
        if keys.len() > 1 && !recursive {
            return Err(io::Error::other(format!("{path} is not empty")));
        }
        for k in keys {
            store.entries.remove(&k);
        }
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> io::Result<()> {
        let src = self.absolute(src);
        let dst = self.absolute(dst);
        let mut store = self.lock()?;
        store.check_fault(&src)?;
        store.check_fault(&dst)?;
        if !store.entries.contains_key(&src) {
            return Err(not_found(&src));
        }
        if store.entries.contains_key(&dst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{dst} already exists"),
            ));
        }
        match parent_of(&dst).and_then(|p| store.entries.get(p)) {
            Some(Entry::Directory { .. }) => {}
            _ => return Err(not_found(&dst)),
        }
        if dst == src || is_under(&dst, &src) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot move {src} under itself"),
            ));
        }
        for k in store.subtree_keys(&src) {
            if let Some(entry) = store.entries.remove(&k) {
                let moved = format!("{dst}{}", &k[src.len()..]);
                store.entries.insert(moved, entry);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_layout() {
        let ufs = MemoryUfs::new();
        ufs.create_file("/a/b/f", b"hello").await.unwrap();
        assert!(ufs.get_status("/a/b").await.unwrap().unwrap().is_directory);
        let list = ufs.list_status("/a/b").await.unwrap().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "f");
        assert_eq!(list[0].length, 5);
        assert!(ufs.list_status("/a/b/f").await.unwrap().is_none());
        assert!(ufs.get_status("/nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let ufs = MemoryUfs::new();
        ufs.mkdirs("/d/e").await.unwrap();
        assert!(ufs.delete("/d", false).await.is_err());
        ufs.rename("/d", "/x").await.unwrap();
        assert!(ufs.exists("/x/e"));
        assert!(!ufs.exists("/d"));
        assert!(ufs.rename("/x", "/missing/y").await.is_err());
        ufs.delete("/x", true).await.unwrap();
        assert!(!ufs.exists("/x/e"));
    }

    #[tokio::test]
    async fn test_scoped_views_share_store() {
        let root = MemoryUfs::new();
        let view = root.scoped("/base");
        view.mkdirs("/").await.unwrap();
        view.create_file("/f", b"1").await.unwrap();
        assert_eq!(root.read("/base/f").unwrap(), b"1");
        let names: Vec<_> = root
            .list_status("/")
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["base".to_string()]);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let ufs = MemoryUfs::new();
        ufs.fail_path_times("/flaky", 2);
        assert!(ufs.mkdirs("/flaky/x").await.is_err());
        assert!(ufs.mkdirs("/flaky/x").await.is_err());
        ufs.mkdirs("/flaky/x").await.unwrap();
        ufs.fail_path("/broken");
        assert!(ufs.get_status("/broken").await.is_err());
        ufs.clear_faults();
        assert!(ufs.get_status("/broken").await.unwrap().is_none());
    }
}
