use super::job::{BackupResult, JobRunner};
use crate::config::BackupJobConfig;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub result: BackupResult,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    pub total_servers: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_wall_secs: f64,
    /// Same order as the configs passed in.
    pub results: Vec<JobReport>,
}

impl BulkResult {
    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }
}

/// Runs every job to completion, at most `max_concurrent` at a time. A job
/// that fails or panics only affects its own entry.
pub async fn run_batch(
    runner: Arc<JobRunner>,
    configs: Vec<BackupJobConfig>,
    max_concurrent: usize,
) -> BulkResult {
    let started = Instant::now();
    let total_servers = configs.len();
    let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
    info!(
        "Starting batch of {} backups (max {} concurrent)",
        total_servers,
        max_concurrent.max(1)
    );

    let names: Vec<String> = configs.iter().map(|c| c.server_name.clone()).collect();
    let handles = configs.into_iter().map(|config| {
        let runner = runner.clone();
        let limit = limit.clone();
        tokio::spawn(async move {
            let _permit = limit.acquire_owned().await;
            let job_started = Instant::now();
            let result = runner.run(&config).await;
            JobReport {
                result,
                duration_secs: job_started.elapsed().as_secs_f64(),
            }
        })
    });

    let results: Vec<JobReport> = join_all(handles)
        .await
        .into_iter()
        .zip(names)
        .map(|(joined, name)| match joined {
            Ok(report) => report,
            Err(e) => {
                error!("[{}] Backup task crashed: {}", name, e);
                JobReport {
                    result: BackupResult::failed(&name, format!("backup task crashed: {}", e), 0.0),
                    duration_secs: 0.0,
                }
            }
        })
        .collect();

    let success_count = results.iter().filter(|r| r.result.success).count();
    let bulk = BulkResult {
        total_servers,
        success_count,
        failure_count: total_servers - success_count,
        total_wall_secs: started.elapsed().as_secs_f64(),
        results,
    };

    info!(
        "Batch finished in {:.1}s: {} succeeded, {} failed",
        bulk.total_wall_secs, bulk.success_count, bulk.failure_count
    );
    bulk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudUploadConfig, CompressionKind, TransferOverrides};
    use crate::remote::testing::{target, FakeTransport};
    use crate::upload::UploadSettings;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn config(host: &str, root: &TempDir) -> BackupJobConfig {
        BackupJobConfig {
            server_name: host.to_string(),
            target: target(host),
            remote_directory: format!("/srv/{}/uploads", host),
            target_subfolder: String::new(),
            compression: CompressionKind::Zip,
            local_root: root.path().to_path_buf(),
            cloud: CloudUploadConfig::default(),
            connect_timeout: Duration::from_secs(1),
            transfer: TransferOverrides {
                max_retries: Some(1),
                retry_delay: Some(Duration::ZERO),
                ..Default::default()
            },
        }
    }

    fn runner(fake: &FakeTransport, root: &TempDir) -> Arc<JobRunner> {
        Arc::new(JobRunner::new(
            fake.clone().into_transport(),
            UploadSettings::new(None, 1024, root.path().join(".relay")),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_is_isolated_and_order_preserved() {
        let fake = FakeTransport::new();
        fake.add_tool("zip");
        for host in ["db1", "db2", "db3", "db4"] {
            fake.add_dir(&format!("/srv/{}/uploads", host));
        }
        fake.mark_unreachable("db2");
        let root = tempdir().unwrap();

        let configs = ["db1", "db2", "db3", "db4"]
            .iter()
            .map(|h| config(h, &root))
            .collect();
        let bulk = run_batch(runner(&fake, &root), configs, 4).await;

        assert_eq!(bulk.total_servers, 4);
        assert_eq!(bulk.success_count, 3);
        assert_eq!(bulk.failure_count, 1);
        let names: Vec<&str> = bulk
            .results
            .iter()
            .map(|r| r.result.server_name.as_str())
            .collect();
        assert_eq!(names, vec!["db1", "db2", "db3", "db4"]);
        assert!(!bulk.results[1].result.success);
        assert!(bulk.results[1].result.error_message.is_some());
        assert!(!bulk.all_succeeded());
    }

    #[tokio::test]
    async fn test_concurrency_limit_of_one_still_runs_everything() {
        let fake = FakeTransport::new();
        fake.add_tool("zip");
        for host in ["a", "b", "c"] {
            fake.add_dir(&format!("/srv/{}/uploads", host));
        }
        let root = tempdir().unwrap();

        let configs = ["a", "b", "c"].iter().map(|h| config(h, &root)).collect();
        let bulk = run_batch(runner(&fake, &root), configs, 0).await;

        assert_eq!(bulk.success_count, 3);
        assert!(bulk.all_succeeded());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let fake = FakeTransport::new();
        let root = tempdir().unwrap();
        let bulk = run_batch(runner(&fake, &root), Vec::new(), 4).await;
        assert_eq!(bulk.total_servers, 0);
        assert!(bulk.results.is_empty());
    }
}
