use log::{info, warn};

use common::{DeleteOptions, FreeOptions, SetAttributeOptions, TtlAction, TtlSetting};

use crate::error::{ErrorKind, MasterError, Result};
use crate::master::NamespaceMaster;
use crate::path::NsPath;

impl NamespaceMaster {
    /// Apply the action of every TTL that expired by `now_ms` and return the
    /// affected paths, parents before children.
    ///
    /// A deleted entry takes its expired descendants with it. A freed entry
    /// has its TTL cleared so it is not freed again.
    pub async fn expire_ttl(&self, now_ms: i64) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        for inode in self.tree.snapshot().await {
            let Some(ttl) = inode.ttl else { continue };
            if ttl.expires_at(inode.creation_time_ms) > now_ms {
                continue;
            }
            if let Some(path) = self.tree.path_of(inode.id).await {
                expired.push((path, inode.id, ttl.action));
            }
        }
        expired.sort_by(|a, b| a.0.depth().cmp(&b.0.depth()).then_with(|| a.0.cmp(&b.0)));

        let mut done = Vec::new();
        for (path, id, action) in expired {
            match self.expire_one(&path, action).await {
                Ok(()) => {
                    info!("ttl of {path} (inode {id}) expired, {action:?} applied");
                    done.push(path.to_string());
                }
                Err(MasterError::PathNotFound(_)) => {}
                Err(e) if e.kind() == ErrorKind::JournalWriteFailure => {
                    return Err(e);
                }
                Err(e) => warn!("ttl action {action:?} on {path} failed: {e}"),
            }
        }
        Ok(done)
    }

    async fn expire_one(&self, path: &NsPath, action: TtlAction) -> Result<()> {
        match action {
            TtlAction::Delete => {
                let options = DeleteOptions {
                    recursive: true,
                    forced: true,
                    metadata_only: false,
                };
                self.delete(path, &options).await
            }
            TtlAction::Free => {
                let options = FreeOptions {
                    recursive: true,
                    forced: true,
                };
                self.free(path, &options).await?;
                let clear = SetAttributeOptions {
                    ttl: Some(TtlSetting::Clear),
                    ..Default::default()
                };
                self.set_attribute(path, &clear).await
            }
        }
    }
}
