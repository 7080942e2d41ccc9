use super::{CloudStore, StrategyKind, UploadRequest};
use crate::config::ConnectionTarget;
use crate::error::{best_effort, BackupError, Result};
use crate::naming::shell_quote;
use crate::remote::{RemoteExecutor, RemoteProbe};
use crate::transfer::{TransferEngine, TransferOptions, MB};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Everything a strategy needs to land one archive in one folder.
#[derive(Clone)]
pub struct UploadContext {
    pub target: ConnectionTarget,
    pub remote_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub folder_id: String,
    pub store: Arc<dyn CloudStore>,
}

impl UploadContext {
    fn request(&self) -> UploadRequest {
        UploadRequest::tuned(&self.file_name, &self.mime_type, &self.folder_id, self.size)
    }
}

#[async_trait]
pub trait UploadStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Returns the cloud object id.
    async fn attempt_upload(&self, ctx: &UploadContext) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct RcloneEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ID", default)]
    id: Option<String>,
}

fn rclone_copy_command(remote: &str, ctx: &UploadContext) -> String {
    format!(
        "rclone copyto {} {} --drive-root-folder-id {} --transfers 4 --buffer-size 256M \
         --low-level-retries 10 --drive-chunk-size 64M",
        shell_quote(&ctx.remote_path),
        shell_quote(&format!("{}:{}", remote, ctx.file_name)),
        shell_quote(&ctx.folder_id)
    )
}

fn rclone_lookup_command(remote: &str, ctx: &UploadContext) -> String {
    format!(
        "rclone lsjson {} --drive-root-folder-id {} --files-only",
        shell_quote(&format!("{}:{}", remote, ctx.file_name)),
        shell_quote(&ctx.folder_id)
    )
}

fn parse_rclone_listing(stdout: &str, file_name: &str) -> Result<String> {
    let entries: Vec<RcloneEntry> = serde_json::from_str(stdout.trim())?;
    entries
        .into_iter()
        .find(|e| e.name == file_name)
        .and_then(|e| e.id)
        .ok_or_else(|| {
            BackupError::cloud(None, format!("rclone did not report an id for {}", file_name))
        })
}

/// Copies straight from the remote disk to the cloud with rclone on the host.
pub struct RemoteCliStrategy {
    executor: RemoteExecutor,
    probe: RemoteProbe,
    remote: String,
}

impl RemoteCliStrategy {
    pub fn new(executor: RemoteExecutor, probe: RemoteProbe, remote: String) -> Self {
        Self {
            executor,
            probe,
            remote,
        }
    }
}

#[async_trait]
impl UploadStrategy for RemoteCliStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RemoteCli
    }

    async fn attempt_upload(&self, ctx: &UploadContext) -> Result<String> {
        if !self.probe.has_tool(&ctx.target, "rclone").await? {
            return Err(BackupError::StrategyUnavailable(format!(
                "rclone is not installed on {}",
                ctx.target.host
            )));
        }

        self.executor
            .run(&ctx.target, &rclone_copy_command(&self.remote, ctx))
            .await?;
        let listing = self
            .executor
            .run(&ctx.target, &rclone_lookup_command(&self.remote, ctx))
            .await?;
        parse_rclone_listing(&listing.stdout, &ctx.file_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Optimized,
    /// Small fixed chunks and the maximum retry budget.
    Chunked,
}

/// Pipes the remote file through this process into the cloud without
/// touching local disk.
pub struct StreamThroughStrategy {
    engine: TransferEngine,
    mode: StreamMode,
}

impl StreamThroughStrategy {
    pub fn new(engine: TransferEngine, mode: StreamMode) -> Self {
        Self { engine, mode }
    }

    fn request(&self, ctx: &UploadContext) -> UploadRequest {
        let mut request = ctx.request();
        if self.mode == StreamMode::Chunked {
            request.chunk_size = MB as usize;
            request.max_retries = 10;
        }
        request
    }
}

#[async_trait]
impl UploadStrategy for StreamThroughStrategy {
    fn kind(&self) -> StrategyKind {
        match self.mode {
            StreamMode::Optimized => StrategyKind::OptimizedStream,
            StreamMode::Chunked => StrategyKind::ChunkedStream,
        }
    }

    async fn attempt_upload(&self, ctx: &UploadContext) -> Result<String> {
        let stream = self
            .engine
            .open_read_stream(&ctx.target, &ctx.remote_path)
            .await?;
        let mut request = self.request(ctx);
        request.size = stream.size();

        ctx.store.upload_stream(Box::new(stream), &request).await
    }
}

/// Downloads the archive, uploads the local copy, then always deletes it.
pub struct LocalRelayStrategy {
    engine: TransferEngine,
    staging_dir: PathBuf,
    options: TransferOptions,
}

impl LocalRelayStrategy {
    pub fn new(engine: TransferEngine, staging_dir: PathBuf, options: TransferOptions) -> Self {
        Self {
            engine,
            staging_dir,
            options,
        }
    }

    async fn relay(&self, ctx: &UploadContext, local_path: &std::path::Path) -> Result<String> {
        self.engine
            .download(&ctx.target, &ctx.remote_path, local_path, &self.options)
            .await?
            .into_result()?;

        let size = tokio::fs::metadata(local_path).await?.len();
        let file = std::fs::File::open(local_path)?;
        let mut request = ctx.request();
        request.size = size;

        info!("Uploading local copy {:?} ({} bytes)", local_path, size);
        ctx.store.upload_stream(Box::new(file), &request).await
    }
}

#[async_trait]
impl UploadStrategy for LocalRelayStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LocalRelay
    }

    async fn attempt_upload(&self, ctx: &UploadContext) -> Result<String> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let local_path = self.staging_dir.join(&ctx.file_name);

        let outcome = self.relay(ctx, &local_path).await;

        if tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
            best_effort("Removing local relay copy", async {
                tokio::fs::remove_file(&local_path)
                    .await
                    .map_err(BackupError::from)
            })
            .await;
        }
        outcome
    }
}
