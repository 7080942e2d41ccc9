use super::strategies::{
    LocalRelayStrategy, RemoteCliStrategy, StreamMode, StreamThroughStrategy, UploadContext,
    UploadStrategy,
};
use super::{CloudStore, FolderRegistry, StrategyKind, UploadOutcome};
use crate::config::{CloudUploadConfig, CompressionKind, ConnectionTarget, UploadMethod};
use crate::error::{BackupError, Result};
use crate::naming::{cloud_folder_name, remote_base_name};
use crate::remote::{RemoteExecutor, RemoteProbe};
use crate::transfer::{TransferEngine, TransferOptions, MB};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Process-wide knobs for the fallback chain.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// rclone remote name on the hosts; `None` disables the remote CLI step.
    pub rclone_remote: Option<String>,
    /// Files strictly above this never go through local storage.
    pub large_file_threshold: u64,
    pub staging_dir: PathBuf,
}

impl UploadSettings {
    pub fn new(rclone_remote: Option<String>, large_file_threshold_mb: u64, staging_dir: PathBuf) -> Self {
        Self {
            rclone_remote,
            large_file_threshold: large_file_threshold_mb * MB,
            staging_dir,
        }
    }
}

/// The ordered strategies to try for an archive of `size` bytes.
pub fn plan_chain(size: u64, method: UploadMethod, settings: &UploadSettings) -> Vec<StrategyKind> {
    let remote_cli = settings
        .rclone_remote
        .as_ref()
        .map(|_| StrategyKind::RemoteCli);

    if size > settings.large_file_threshold {
        return remote_cli
            .into_iter()
            .chain([StrategyKind::OptimizedStream, StrategyKind::ChunkedStream])
            .collect();
    }

    match method {
        UploadMethod::Direct => remote_cli
            .into_iter()
            .chain([StrategyKind::OptimizedStream, StrategyKind::LocalRelay])
            .collect(),
        UploadMethod::Local => vec![StrategyKind::LocalRelay],
    }
}

fn mime_for(file_name: &str) -> &'static str {
    if file_name.ends_with(".tar.gz") {
        CompressionKind::TarGz.mime_type()
    } else if file_name.ends_with(".zip") {
        CompressionKind::Zip.mime_type()
    } else {
        "application/octet-stream"
    }
}

/// Walks the fallback chain until one strategy lands the archive.
pub struct UploadResolver {
    executor: RemoteExecutor,
    probe: RemoteProbe,
    engine: TransferEngine,
    folders: Arc<FolderRegistry>,
    settings: UploadSettings,
    transfer: TransferOptions,
}

impl UploadResolver {
    pub fn new(
        executor: RemoteExecutor,
        probe: RemoteProbe,
        engine: TransferEngine,
        folders: Arc<FolderRegistry>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            executor,
            probe,
            engine,
            folders,
            settings,
            transfer: TransferOptions::default(),
        }
    }

    /// Transfer options used by the local relay's download.
    pub fn with_transfer_options(mut self, transfer: TransferOptions) -> Self {
        self.transfer = transfer;
        self
    }

    fn strategy(&self, kind: StrategyKind) -> Option<Box<dyn UploadStrategy>> {
        let strategy: Box<dyn UploadStrategy> = match kind {
            StrategyKind::RemoteCli => Box::new(RemoteCliStrategy::new(
                self.executor.clone(),
                self.probe.clone(),
                self.settings.rclone_remote.clone()?,
            )),
            StrategyKind::OptimizedStream => Box::new(StreamThroughStrategy::new(
                self.engine.clone(),
                StreamMode::Optimized,
            )),
            StrategyKind::ChunkedStream => Box::new(StreamThroughStrategy::new(
                self.engine.clone(),
                StreamMode::Chunked,
            )),
            StrategyKind::LocalRelay => Box::new(LocalRelayStrategy::new(
                self.engine.clone(),
                self.settings.staging_dir.clone(),
                self.transfer.clone(),
            )),
        };
        Some(strategy)
    }

    pub async fn upload(
        &self,
        store: Arc<dyn CloudStore>,
        target: &ConnectionTarget,
        remote_path: &str,
        server_name: &str,
        cloud: &CloudUploadConfig,
        date: NaiveDate,
    ) -> Result<UploadOutcome> {
        let size = self.engine.remote_size(target, remote_path).await?;
        let chain = plan_chain(size, cloud.upload_method, &self.settings);

        let folder_name = cloud_folder_name(date, server_name);
        let folder_id = self
            .folders
            .ensure(store.as_ref(), &folder_name, cloud.destination_folder_id.as_deref())
            .await?;

        let file_name = remote_base_name(remote_path).to_string();
        let ctx = UploadContext {
            target: target.clone(),
            remote_path: remote_path.to_string(),
            mime_type: mime_for(&file_name).to_string(),
            file_name,
            size,
            folder_id,
            store,
        };

        info!(
            "[{}] Uploading {} ({:.2} MB) to {} via {}",
            server_name,
            remote_path,
            size as f64 / MB as f64,
            folder_name,
            chain
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let mut last_error = None;
        for kind in &chain {
            let Some(strategy) = self.strategy(*kind) else {
                continue;
            };
            let started = Instant::now();

            match strategy.attempt_upload(&ctx).await {
                Ok(object_id) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    info!(
                        "[{}] Upload succeeded via {} in {:.1}s (object {})",
                        server_name, kind, elapsed, object_id
                    );
                    return Ok(UploadOutcome {
                        cloud_object_id: object_id,
                        destination_folder_name: folder_name,
                        strategy_used: *kind,
                        upload_duration_secs: elapsed,
                        byte_size: size,
                    });
                }
                Err(e) => {
                    warn!("[{}] Upload via {} failed: {}", server_name, kind, e);
                    last_error = Some(e);
                }
            }
        }

        let attempted = chain
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Err(BackupError::UploadChainExhausted {
            attempted,
            last: Box::new(last_error.unwrap_or_else(|| {
                BackupError::StrategyUnavailable("no upload strategy applies".to_string())
            })),
        })
    }
}
