use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{CheckConsistencyOptions, FileInfo, ListStatusOptions, LoadMetadataType};
use libnamespace::{
    ConsistencyReport, DefaultUfsFactory, DirDataPlane, MasterConfig, NamespaceMaster, NsPath,
};
use log::{error, info};
use tokio::time::MissedTickBehavior;

/// Recover the namespace described by `config`.
pub async fn open(config: MasterConfig) -> Result<Arc<NamespaceMaster>> {
    tokio::fs::create_dir_all(&config.cache_dir)
        .await
        .with_context(|| format!("Failed to create cache dir {}", config.cache_dir.display()))?;
    let data_plane = Arc::new(DirDataPlane::new(config.cache_dir.clone()));
    let factory = Arc::new(DefaultUfsFactory::new());
    let journal_dir = config.journal_dir.clone();
    NamespaceMaster::open(config, factory, data_plane)
        .await
        .with_context(|| format!("Failed to recover namespace from {}", journal_dir.display()))
}

/// Run background work and the TTL timer until `shutdown` resolves, then
/// stop cleanly.
pub async fn run_until<F>(master: Arc<NamespaceMaster>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    master.start_background();
    let secs = master.config().ttl_check_interval_secs.max(1);
    let mut ttl_timer = tokio::time::interval(Duration::from_secs(secs));
    ttl_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = ttl_timer.tick() => {
                let now = chrono::Utc::now().timestamp_millis();
                match master.expire_ttl(now).await {
                    Ok(expired) if !expired.is_empty() => {
                        info!("ttl check expired {} entries", expired.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("ttl check failed: {e}"),
                }
                if master.is_halted() {
                    error!("namespace halted after a journal failure, stopping");
                    break;
                }
            }
        }
    }
    master.shutdown().await.context("Failed to shut down cleanly")
}

/// Serve until Ctrl-C.
pub async fn start(config: MasterConfig) -> Result<()> {
    let master = open(config).await?;
    info!(
        "namespace master up, root mounted from {}",
        master.get_ufs_address().await?
    );
    run_until(master, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
    })
    .await
}

pub async fn checkpoint(config: MasterConfig) -> Result<u64> {
    let master = open(config).await?;
    let seq = master.checkpoint().await.context("Failed to write checkpoint")?;
    Ok(seq)
}

pub async fn check(config: MasterConfig, path: &str) -> Result<ConsistencyReport> {
    let path: NsPath = path.parse()?;
    let master = open(config).await?;
    let report = master
        .check_consistency(&path, &CheckConsistencyOptions::default())
        .await?;
    Ok(report)
}

pub async fn list(config: MasterConfig, path: &str, recursive: bool) -> Result<Vec<FileInfo>> {
    let path: NsPath = path.parse()?;
    let master = open(config).await?;
    let options = ListStatusOptions {
        recursive,
        load_metadata: LoadMetadataType::Once,
    };
    let infos = master.list_status(&path, &options).await?;
    Ok(infos)
}

/// One `ls -l` style line per entry.
pub fn format_listing(infos: &[FileInfo]) -> Vec<String> {
    infos
        .iter()
        .map(|info| {
            let kind = if info.is_directory() { 'd' } else { '-' };
            format!(
                "{kind}{:o} {:<8} {:<8} {:>12} {} {}",
                info.mode,
                info.owner,
                info.group,
                info.length,
                info.modification_time().format("%Y-%m-%d %H:%M"),
                info.path
            )
        })
        .collect()
}
