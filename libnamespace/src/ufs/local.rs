//! UFS over a local directory.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{fs, io::AsyncWriteExt};

use super::{UfsStatus, UnderFileSystem};

pub struct LocalUfs {
    root: PathBuf,
}

impl LocalUfs {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, path: &str) -> PathBuf {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

fn status_of(name: String, meta: &std::fs::Metadata) -> UfsStatus {
    let modification_time_ms = meta
        .modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or_default();
    UfsStatus {
        name,
        is_directory: meta.is_dir(),
        length: if meta.is_dir() { 0 } else { meta.len() },
        modification_time_ms,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl UnderFileSystem for LocalUfs {
    async fn get_status(&self, path: &str) -> io::Result<Option<UfsStatus>> {
        let p = self.path_for(path);
        match fs::metadata(&p).await {
            Ok(meta) => Ok(Some(status_of(file_name(&p), &meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_status(&self, path: &str) -> io::Result<Option<Vec<UfsStatus>>> {
        let p = self.path_for(path);
        match fs::metadata(&p).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut dir = fs::read_dir(&p).await?;
        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            out.push(status_of(entry.file_name().to_string_lossy().into_owned(), &meta));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(out))
    }

    async fn mkdirs(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.path_for(path)).await
    }

    async fn create_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let p = self.path_for(path);
        if let Some(dir) = p.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut f = fs::File::create(&p).await?;
        f.write_all(data).await?;
        f.flush().await?;
        f.sync_all().await?;
        Ok(())
    }

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()> {
        let p = self.path_for(path);
        let meta = fs::metadata(&p).await?;
        if !meta.is_dir() {
            fs::remove_file(&p).await
        } else if recursive {
            fs::remove_dir_all(&p).await
        } else {
            fs::remove_dir(&p).await
        }
    }

    async fn rename(&self, src: &str, dst: &str) -> io::Result<()> {
        let (src, dst) = (self.path_for(src), self.path_for(dst));
        if fs::try_exists(&dst).await? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", dst.display()),
            ));
        }
        fs::rename(&src, &dst).await
    }
}
