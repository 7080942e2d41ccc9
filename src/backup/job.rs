use crate::backup::compression::{calculate_sha256, Compressor};
use crate::config::{AppConfig, BackupJobConfig};
use crate::error::{best_effort, BackupError, Result};
use crate::naming::remote_base_name;
use crate::notify::{create_notifiers, FailureNotice, Notifier, SuccessNotice};
use crate::remote::ssh::SshTransport;
use crate::remote::{RemoteExecutor, RemoteProbe, Transport};
use crate::transfer::{TransferEngine, TransferOptions, MB};
use crate::upload::{
    CloudProvider, DriveProvider, FolderRegistry, StrategyKind, UploadOutcome, UploadResolver,
    UploadSettings,
};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Init,
    SshVerified,
    ToolsVerified,
    DirectoryVerified,
    Compressed,
    Transferred,
    CleanedUp,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Flags only ever flip from false to true, and only through [`JobProgress`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepStatus {
    pub ssh_connection: bool,
    pub directory_check: bool,
    pub compression: bool,
    pub transfer: bool,
    pub cloud_upload: bool,
}

#[derive(Debug, Clone)]
pub struct JobProgress {
    state: JobState,
    steps: StepStatus,
}

impl JobProgress {
    pub fn new() -> Self {
        Self {
            state: JobState::Init,
            steps: StepStatus::default(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn steps(&self) -> &StepStatus {
        &self.steps
    }

    fn successor(&self) -> Option<JobState> {
        match self.state {
            JobState::Init => Some(JobState::SshVerified),
            JobState::SshVerified => Some(JobState::ToolsVerified),
            JobState::ToolsVerified => Some(JobState::DirectoryVerified),
            JobState::DirectoryVerified => Some(JobState::Compressed),
            JobState::Compressed => Some(JobState::Transferred),
            JobState::Transferred => Some(JobState::CleanedUp),
            JobState::CleanedUp => Some(JobState::Succeeded),
            JobState::Succeeded | JobState::Failed => None,
        }
    }

    /// Moves to the next state, which must be the immediate successor.
    /// Anything else is refused and leaves the progress untouched.
    pub fn advance(&mut self, next: JobState) -> bool {
        if self.successor() != Some(next) {
            debug!("Refusing job transition {:?} -> {:?}", self.state, next);
            return false;
        }
        self.state = next;
        match next {
            JobState::SshVerified => self.steps.ssh_connection = true,
            JobState::DirectoryVerified => self.steps.directory_check = true,
            JobState::Compressed => self.steps.compression = true,
            JobState::Transferred => self.steps.transfer = true,
            _ => {}
        }
        true
    }

    pub fn mark_cloud_upload(&mut self) {
        if self.state == JobState::Transferred {
            self.steps.cloud_upload = true;
        }
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = JobState::Failed;
        }
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub success: bool,
    pub server_name: String,
    pub local_file_path: Option<String>,
    pub cloud_object_id: Option<String>,
    pub byte_size_mb: Option<f64>,
    pub error_message: Option<String>,
    pub steps: StepStatus,
    pub strategy_used: Option<StrategyKind>,
    pub folder_name: Option<String>,
    pub sha256: Option<String>,
    pub duration_secs: f64,
    pub final_state: JobState,
}

impl BackupResult {
    /// For jobs that never got as far as the state machine.
    pub fn failed(server_name: &str, error_message: String, duration_secs: f64) -> Self {
        let mut progress = JobProgress::new();
        progress.fail();
        Self {
            success: false,
            server_name: server_name.to_string(),
            local_file_path: None,
            cloud_object_id: None,
            byte_size_mb: None,
            error_message: Some(error_message),
            steps: progress.steps,
            strategy_used: None,
            folder_name: None,
            sha256: None,
            duration_secs,
            final_state: progress.state,
        }
    }
}

/// Where the archive ended up.
#[derive(Debug)]
enum Delivery {
    Local {
        path: PathBuf,
        byte_size: u64,
        sha256: Option<String>,
    },
    Cloud(UploadOutcome),
}

/// Per-job collaborators, built with the job's own connect timeout.
struct JobTools {
    executor: RemoteExecutor,
    probe: RemoteProbe,
    compressor: Compressor,
    engine: TransferEngine,
}

/// Runs one server's backup from SSH check to cleanup. Shared by every job
/// in a batch.
pub struct JobRunner {
    transport: Arc<dyn Transport>,
    cloud: Option<Arc<dyn CloudProvider>>,
    folders: Arc<FolderRegistry>,
    upload: UploadSettings,
    notifiers: Vec<Box<dyn Notifier>>,
}

impl JobRunner {
    pub fn new(transport: Arc<dyn Transport>, upload: UploadSettings) -> Self {
        Self {
            transport,
            cloud: None,
            folders: Arc::new(FolderRegistry::new()),
            upload,
            notifiers: Vec::new(),
        }
    }

    pub fn with_cloud(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(provider);
        self
    }

    pub fn with_notifiers(mut self, notifiers: Vec<Box<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// The production wiring: ssh2 transport, Google Drive, configured notifiers.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let drive = config.drive.as_ref();
        let upload = UploadSettings::new(
            drive.and_then(|d| d.rclone_remote.clone()),
            drive.map_or(1024, |d| d.large_file_threshold_mb),
            config.local_backup_dir.join(".relay"),
        );
        let provider = DriveProvider::new(drive.map(|d| d.credentials_file.clone()));

        Ok(Self::new(Arc::new(SshTransport), upload)
            .with_cloud(Arc::new(provider))
            .with_notifiers(create_notifiers(&config.notifications)?))
    }

    fn tools(&self, config: &BackupJobConfig) -> JobTools {
        let executor = RemoteExecutor::new(self.transport.clone(), config.connect_timeout);
        JobTools {
            probe: RemoteProbe::new(executor.clone()),
            compressor: Compressor::new(executor.clone()),
            engine: TransferEngine::new(self.transport.clone(), config.connect_timeout),
            executor,
        }
    }

    /// Never fails: every outcome, including a crash in a step, is folded
    /// into the returned result.
    pub async fn run(&self, config: &BackupJobConfig) -> BackupResult {
        let started = Instant::now();
        let tools = self.tools(config);
        let mut progress = JobProgress::new();
        let mut archive: Option<String> = None;

        info!("[{}] Starting backup of {}", config.server_name, config.remote_directory);
        let outcome = self.execute(config, &tools, &mut progress, &mut archive).await;

        if let Some(path) = &archive {
            tools.compressor.delete_remote_file(&config.target, path).await;
        }
        if outcome.is_ok() {
            progress.advance(JobState::CleanedUp);
            progress.advance(JobState::Succeeded);
        } else {
            progress.fail();
        }

        let duration_secs = started.elapsed().as_secs_f64();
        let result = build_result(config, progress, outcome, duration_secs);

        if result.success {
            info!(
                "[{}] Backup completed in {:.1}s ({:.2} MB)",
                result.server_name,
                duration_secs,
                result.byte_size_mb.unwrap_or_default()
            );
        } else {
            error!(
                "[{}] Backup failed after {:.1}s: {}",
                result.server_name,
                duration_secs,
                result.error_message.as_deref().unwrap_or("unknown error")
            );
        }

        self.notify(&result).await;
        result
    }

    async fn execute(
        &self,
        config: &BackupJobConfig,
        tools: &JobTools,
        progress: &mut JobProgress,
        archive: &mut Option<String>,
    ) -> Result<Delivery> {
        let target = &config.target;

        tools.executor.verify_connection(target).await?;
        progress.advance(JobState::SshVerified);
        debug!("[{}] SSH connection verified", config.server_name);

        let report = tools
            .probe
            .check_required_tools(target, config.compression)
            .await?;
        if !report.available {
            return Err(BackupError::MissingTools(report.missing));
        }
        progress.advance(JobState::ToolsVerified);

        if !tools
            .probe
            .directory_exists(target, &config.remote_directory)
            .await?
        {
            return Err(BackupError::DirectoryNotFound(config.remote_directory.clone()));
        }
        progress.advance(JobState::DirectoryVerified);

        // recorded before compressing so a half-written archive is cleaned up too
        let path = tools
            .compressor
            .next_archive_path(&config.remote_directory, config.compression);
        *archive = Some(path.clone());
        tools
            .compressor
            .compress_folder(target, &config.remote_directory, &path, config.compression)
            .await?;
        progress.advance(JobState::Compressed);

        let transfer = TransferOptions::with_overrides(config.transfer.clone());
        let delivery = if config.cloud.enabled {
            let provider = self.cloud.as_ref().ok_or_else(|| {
                BackupError::Config("cloud upload enabled but no cloud provider configured".to_string())
            })?;
            let store = provider.store_for(&config.cloud)?;

            let resolver = UploadResolver::new(
                tools.executor.clone(),
                tools.probe.clone(),
                tools.engine.clone(),
                self.folders.clone(),
                UploadSettings {
                    staging_dir: config.local_dir().join(".relay"),
                    ..self.upload.clone()
                },
            )
            .with_transfer_options(transfer);

            let outcome = resolver
                .upload(
                    store,
                    target,
                    &path,
                    &config.server_name,
                    &config.cloud,
                    Local::now().date_naive(),
                )
                .await?;
            Delivery::Cloud(outcome)
        } else {
            let local_path = config.local_dir().join(remote_base_name(&path));
            let result = tools
                .engine
                .download(target, &path, &local_path, &transfer)
                .await?
                .into_result()?;

            let hash_path = local_path.clone();
            let sha256 =
                best_effort("Archive checksum", async move {
                    tokio::task::spawn_blocking(move || calculate_sha256(&hash_path)).await?
                })
                .await;

            Delivery::Local {
                path: local_path,
                byte_size: result.byte_size,
                sha256,
            }
        };

        progress.advance(JobState::Transferred);
        if matches!(delivery, Delivery::Cloud(_)) {
            progress.mark_cloud_upload();
        }
        Ok(delivery)
    }

    async fn notify(&self, result: &BackupResult) {
        for notifier in &self.notifiers {
            if result.success {
                let notice = SuccessNotice {
                    server_name: result.server_name.clone(),
                    size_mb: result.byte_size_mb.unwrap_or_default(),
                    duration_secs: result.duration_secs,
                    local_path: result.local_file_path.clone(),
                    cloud_uploaded: result.cloud_object_id.is_some(),
                    strategy_used: result.strategy_used,
                    folder_name: result.folder_name.clone(),
                    sha256: result.sha256.clone(),
                };
                best_effort(notifier.name(), notifier.notify_success(&notice)).await;
            } else {
                let notice = FailureNotice {
                    server_name: result.server_name.clone(),
                    error_message: result.error_message.clone().unwrap_or_default(),
                    duration_secs: result.duration_secs,
                };
                best_effort(notifier.name(), notifier.notify_failure(&notice)).await;
            }
        }
    }
}

fn build_result(
    config: &BackupJobConfig,
    progress: JobProgress,
    outcome: Result<Delivery>,
    duration_secs: f64,
) -> BackupResult {
    let mut result = BackupResult {
        success: false,
        server_name: config.server_name.clone(),
        local_file_path: None,
        cloud_object_id: None,
        byte_size_mb: None,
        error_message: None,
        steps: progress.steps().clone(),
        strategy_used: None,
        folder_name: None,
        sha256: None,
        duration_secs,
        final_state: progress.state(),
    };

    match outcome {
        Ok(Delivery::Local {
            path,
            byte_size,
            sha256,
        }) => {
            result.success = true;
            result.local_file_path = Some(path.to_string_lossy().to_string());
            result.byte_size_mb = Some(byte_size as f64 / MB as f64);
            result.sha256 = sha256;
        }
        Ok(Delivery::Cloud(outcome)) => {
            result.success = true;
            result.cloud_object_id = Some(outcome.cloud_object_id);
            result.byte_size_mb = Some(outcome.byte_size as f64 / MB as f64);
            result.strategy_used = Some(outcome.strategy_used);
            result.folder_name = Some(outcome.destination_folder_name);
        }
        Err(e) => {
            result.error_message = Some(e.to_string());
        }
    }
    result
}
