use super::{throughput_mbps, TransferOptions, TransferPlan, TransferProgress, TransferResult, MB};
use crate::error::{best_effort, BackupError, Result};
use crate::log::LogThrottle;
use crate::remote::{
    self, ConnectionTarget, CopyPlan, ProgressFn, RemoteReadStream, RemoteSession,
    SessionProfile, Transport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Direction {
    Download { remote: String, local: PathBuf },
    Upload { local: PathBuf, remote: String },
}

impl Direction {
    fn label(&self) -> String {
        match self {
            Direction::Download { remote, .. } => format!("download {}", remote),
            Direction::Upload { remote, .. } => format!("upload {}", remote),
        }
    }

    fn result_path(&self) -> String {
        match self {
            Direction::Download { local, .. } => local.to_string_lossy().to_string(),
            Direction::Upload { remote, .. } => remote.clone(),
        }
    }

    /// A failed download can leave a pre-sized, partly zeroed file behind.
    async fn discard_partial(&self) {
        if let Direction::Download { local, .. } = self {
            if tokio::fs::try_exists(local).await.unwrap_or(false) {
                best_effort("Partial download cleanup", async {
                    tokio::fs::remove_file(local).await.map_err(BackupError::from)
                })
                .await;
            }
        }
    }

    fn copy(&self, session: &mut dyn RemoteSession, plan: CopyPlan, progress: ProgressFn) -> Result<u64> {
        match self {
            Direction::Download { remote, local } => session.fast_get(remote, local, plan, progress),
            Direction::Upload { local, remote } => session.fast_put(local, remote, plan, progress),
        }
    }
}

/// Moves a blocking session onto the blocking pool for one operation and
/// hands it back together with the outcome.
async fn with_session<T, F>(
    mut session: Box<dyn RemoteSession>,
    op: F,
) -> Result<(Box<dyn RemoteSession>, Result<T>)>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn RemoteSession) -> Result<T> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let outcome = op(session.as_mut());
        (session, outcome)
    })
    .await?;
    Ok(joined)
}

#[derive(Clone)]
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
}

impl TransferEngine {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
        }
    }

    fn profile_for(&self, large_file: bool) -> SessionProfile {
        if large_file {
            SessionProfile::large_file(self.connect_timeout)
        } else {
            SessionProfile::standard(self.connect_timeout)
        }
    }

    pub async fn remote_size(&self, target: &ConnectionTarget, remote_path: &str) -> Result<u64> {
        let session = remote::connect(&self.transport, target, &self.profile_for(false)).await?;
        let path = remote_path.to_string();
        let (_session, size) = with_session(session, move |s| s.stat_size(&path)).await?;
        size
    }

    /// Remote to local. Only a failure to open the first session is an `Err`;
    /// everything after that is reported in the result.
    pub async fn download(
        &self,
        target: &ConnectionTarget,
        remote_path: &str,
        local_path: &Path,
        opts: &TransferOptions,
    ) -> Result<TransferResult> {
        let session = remote::connect(&self.transport, target, &self.profile_for(false)).await?;
        let path = remote_path.to_string();
        let (session, size) = with_session(session, move |s| s.stat_size(&path)).await?;

        let direction = Direction::Download {
            remote: remote_path.to_string(),
            local: local_path.to_path_buf(),
        };
        match size {
            Ok(size) => Ok(self.run_copy(target, session, direction, size, opts).await),
            Err(e) => Ok(failed(&direction, 0, Duration::ZERO, 0, e.to_string())),
        }
    }

    /// Local to remote, same contract as [`download`](Self::download).
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        target: &ConnectionTarget,
        opts: &TransferOptions,
    ) -> Result<TransferResult> {
        let direction = Direction::Upload {
            local: local_path.to_path_buf(),
            remote: remote_path.to_string(),
        };
        let size = tokio::fs::metadata(local_path).await.map(|m| m.len());

        let session = remote::connect(&self.transport, target, &self.profile_for(false)).await?;
        match size {
            Ok(size) => Ok(self.run_copy(target, session, direction, size, opts).await),
            Err(e) => Ok(failed(&direction, 0, Duration::ZERO, 0, e.to_string())),
        }
    }

    /// Opens the remote file for sequential reading. The returned stream owns
    /// its session; dropping it closes both.
    pub async fn open_read_stream(
        &self,
        target: &ConnectionTarget,
        remote_path: &str,
    ) -> Result<RemoteReadStream> {
        let session = remote::connect(&self.transport, target, &self.profile_for(false)).await?;
        let path = remote_path.to_string();
        let large_profile = self.profile_for(true);

        let (session, opened) = with_session(session, move |s| {
            let size = s.stat_size(&path)?;
            if size >= super::LARGE_FILE_BYTES {
                s.tune(&large_profile);
            }
            let reader = s.open_read(&path)?;
            Ok((reader, size))
        })
        .await?;

        let (reader, size) = opened?;
        Ok(RemoteReadStream::new(reader, size, session))
    }

    async fn run_copy(
        &self,
        target: &ConnectionTarget,
        session: Box<dyn RemoteSession>,
        direction: Direction,
        size: u64,
        opts: &TransferOptions,
    ) -> TransferResult {
        let plan = TransferPlan::resolve(size, &opts.overrides);
        let profile = self.profile_for(plan.large_file);
        let mut session = Some(session);
        if plan.large_file {
            if let Some(s) = session.as_mut() {
                s.tune(&profile);
            }
        }

        info!(
            "Starting {} ({:.2} MB, concurrency {}, chunk {} KB, up to {} attempts)",
            direction.label(),
            size as f64 / MB as f64,
            plan.copy.concurrency,
            plan.copy.chunk_size / 1024,
            plan.max_attempts
        );

        let started = Instant::now();
        let throttle = Arc::new(LogThrottle::new(PROGRESS_LOG_INTERVAL));
        let mut last_error = String::new();

        for attempt in 1..=plan.max_attempts {
            let current = match session.take() {
                Some(s) => s,
                None => match remote::connect(&self.transport, target, &profile).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("{}: reconnect for attempt {} failed: {}", direction.label(), attempt, e);
                        last_error = e.to_string();
                        if attempt < plan.max_attempts {
                            tokio::time::sleep(plan.retry_delay).await;
                        }
                        continue;
                    }
                },
            };

            let progress = progress_fn(direction.label(), attempt, throttle.clone(), opts);
            let copy_direction = direction.clone();
            let copy_plan = plan.copy;
            let outcome =
                with_session(current, move |s| copy_direction.copy(s, copy_plan, progress)).await;

            match outcome {
                Ok((_, Ok(bytes))) => {
                    let elapsed = started.elapsed();
                    let mbps = throughput_mbps(bytes, elapsed);
                    info!(
                        "Finished {}: {:.2} MB in {:.1}s ({:.2} MB/s, attempt {}/{})",
                        direction.label(),
                        bytes as f64 / MB as f64,
                        elapsed.as_secs_f64(),
                        mbps,
                        attempt,
                        plan.max_attempts
                    );
                    return TransferResult {
                        path: direction.result_path(),
                        byte_size: bytes,
                        duration_secs: elapsed.as_secs_f64(),
                        average_mbps: mbps,
                        attempts: attempt,
                        success: true,
                        error_detail: None,
                    };
                }
                Ok((returned, Err(e))) => {
                    warn!(
                        "{} failed on attempt {}/{}: {}",
                        direction.label(),
                        attempt,
                        plan.max_attempts,
                        e
                    );
                    // a dead session is replaced on the next attempt
                    if !e.is_connection() {
                        session = Some(returned);
                    }
                    last_error = e.to_string();
                }
                Err(e) => {
                    warn!("{} worker crashed on attempt {}: {}", direction.label(), attempt, e);
                    last_error = e.to_string();
                }
            }

            if attempt < plan.max_attempts {
                tokio::time::sleep(plan.retry_delay).await;
            }
        }

        warn!(
            "{} gave up after {} attempts: {}",
            direction.label(),
            plan.max_attempts,
            last_error
        );
        direction.discard_partial().await;
        failed(&direction, size, started.elapsed(), plan.max_attempts, last_error)
    }
}

fn failed(
    direction: &Direction,
    size: u64,
    elapsed: Duration,
    attempts: u32,
    error: String,
) -> TransferResult {
    TransferResult {
        path: direction.result_path(),
        byte_size: size,
        duration_secs: elapsed.as_secs_f64(),
        average_mbps: 0.0,
        attempts,
        success: false,
        error_detail: Some(error),
    }
}

fn progress_fn(
    label: String,
    attempt: u32,
    throttle: Arc<LogThrottle>,
    opts: &TransferOptions,
) -> ProgressFn {
    let sink = opts.progress.clone();
    Arc::new(move |transferred, total| {
        if let Some(sink) = &sink {
            sink.send_replace(TransferProgress {
                transferred,
                total,
                attempt,
            });
        }
        if throttle.should_log() {
            let percent = if total > 0 {
                transferred as f64 * 100.0 / total as f64
            } else {
                100.0
            };
            info!(
                "{}: {:.1}% ({:.1}/{:.1} MB)",
                label,
                percent,
                transferred as f64 / MB as f64,
                total as f64 / MB as f64
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferOverrides;
    use crate::remote::testing::{target, FakeTransport};
    use crate::transfer::GB;
    use std::io::Read;
    use tempfile::tempdir;
    use tokio::sync::watch;

    fn engine(fake: &FakeTransport) -> TransferEngine {
        TransferEngine::new(fake.clone().into_transport(), Duration::from_secs(1))
    }

    fn fast_retries(max: u32) -> TransferOptions {
        TransferOptions::with_overrides(TransferOverrides {
            max_retries: Some(max),
            retry_delay: Some(Duration::ZERO),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_download_succeeds_first_try() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/site.zip", b"0123456789");
        let dir = tempdir().unwrap();
        let local = dir.path().join("out").join("site.zip");

        let result = engine(&fake)
            .download(&target("web"), "/tmp/site.zip", &local, &fast_retries(3))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.byte_size, 10);
        assert_eq!(std::fs::read(&local).unwrap(), b"0123456789");
        assert_eq!(
            fake.copy_plans()[0],
            CopyPlan {
                concurrency: 32,
                chunk_size: 64 * 1024
            }
        );
    }

    #[tokio::test]
    async fn test_download_recovers_after_transient_failures() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/site.zip", b"payload");
        fake.fail_next_copies(2);
        let dir = tempdir().unwrap();

        let result = engine(&fake)
            .download(
                &target("web"),
                "/tmp/site.zip",
                &dir.path().join("site.zip"),
                &fast_retries(3),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(fake.copy_plans().len(), 3);
    }

    #[tokio::test]
    async fn test_download_exhaustion_reports_failure_without_error() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/site.zip", b"payload");
        fake.fail_next_copies(10);
        let dir = tempdir().unwrap();
        let local = dir.path().join("site.zip");

        let result = engine(&fake)
            .download(&target("web"), "/tmp/site.zip", &local, &fast_retries(3))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(fake.copy_plans().len(), 3);
        assert!(result.error_detail.unwrap().contains("simulated copy failure"));
        assert!(!local.exists(), "pre-sized partial file left behind");
    }

    #[tokio::test]
    async fn test_retry_overwrites_partial_file() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/site.zip", b"payload");
        fake.fail_next_copies(1);
        let dir = tempdir().unwrap();
        let local = dir.path().join("site.zip");

        let result = engine(&fake)
            .download(&target("web"), "/tmp/site.zip", &local, &fast_retries(2))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(std::fs::read(&local).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_download_missing_file_is_failed_result() {
        let fake = FakeTransport::new();
        let dir = tempdir().unwrap();
        let result = engine(&fake)
            .download(
                &target("web"),
                "/tmp/nope.zip",
                &dir.path().join("nope.zip"),
                &fast_retries(3),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(fake.copy_plans().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let fake = FakeTransport::new();
        fake.mark_unreachable("down");
        let dir = tempdir().unwrap();

        let err = engine(&fake)
            .download(
                &target("down"),
                "/tmp/site.zip",
                &dir.path().join("site.zip"),
                &fast_retries(3),
            )
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_progress_is_published() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/site.zip", b"abcdef");
        let dir = tempdir().unwrap();
        let (tx, rx) = watch::channel(TransferProgress::default());
        let mut opts = fast_retries(1);
        opts.progress = Some(Arc::new(tx));

        engine(&fake)
            .download(&target("web"), "/tmp/site.zip", &dir.path().join("a.zip"), &opts)
            .await
            .unwrap();

        let last = *rx.borrow();
        assert_eq!(last.transferred, 6);
        assert_eq!(last.total, 6);
        assert_eq!(last.attempt, 1);
    }

    #[tokio::test]
    async fn test_large_download_uses_large_tier_and_session_profile() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/huge.tar.gz", b"not really huge");
        fake.set_size("/tmp/huge.tar.gz", 2 * GB);
        let dir = tempdir().unwrap();

        engine(&fake)
            .download(
                &target("web"),
                "/tmp/huge.tar.gz",
                &dir.path().join("huge.tar.gz"),
                &fast_retries(1),
            )
            .await
            .unwrap();

        assert_eq!(
            fake.copy_plans()[0],
            CopyPlan {
                concurrency: 96,
                chunk_size: 256 * 1024
            }
        );
        let profiles = fake.profiles();
        assert!(profiles.contains(&SessionProfile::large_file(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let fake = FakeTransport::new();
        let dir = tempdir().unwrap();
        let local = dir.path().join("site.zip");
        std::fs::write(&local, b"local bytes").unwrap();

        let result = engine(&fake)
            .upload(&local, "/srv/incoming/site.zip", &target("web"), &fast_retries(2))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(fake.file("/srv/incoming/site.zip").unwrap(), b"local bytes");
    }

    #[tokio::test]
    async fn test_open_read_stream() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/site.zip", b"streamed");

        let mut stream = engine(&fake)
            .open_read_stream(&target("web"), "/tmp/site.zip")
            .await
            .unwrap();
        assert_eq!(stream.size(), 8);
        let mut buf = String::new();
        stream.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "streamed");
    }
}
