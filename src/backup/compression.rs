use crate::config::{CompressionKind, ConnectionTarget};
use crate::error::{best_effort, Result};
use crate::naming::{normalize_file_name, remote_base_name, remote_parent, shell_quote};
use crate::remote::RemoteExecutor;
use chrono::Utc;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

/// Remote scratch directory for archives awaiting transfer.
const REMOTE_STAGING_DIR: &str = "/tmp";

/// `<staging>/<clean folder name>_<millis>.<ext>`
pub fn archive_path(folder_path: &str, kind: CompressionKind, millis: i64) -> String {
    format!(
        "{}/{}_{}.{}",
        REMOTE_STAGING_DIR,
        normalize_file_name(remote_base_name(folder_path)),
        millis,
        kind.extension()
    )
}

/// Archives the folder's last component relative to its parent, at the
/// lowest CPU priority so live services on the host are not starved.
pub fn compress_command(folder_path: &str, archive: &str, kind: CompressionKind) -> String {
    let parent = shell_quote(remote_parent(folder_path));
    let name = shell_quote(remote_base_name(folder_path));
    let archive = shell_quote(archive);

    match kind {
        CompressionKind::Zip => format!("cd {} && nice -n 19 zip -rq {} {}", parent, archive, name),
        CompressionKind::TarGz => {
            format!("nice -n 19 tar -czf {} -C {} {}", archive, parent, name)
        }
    }
}

#[derive(Clone)]
pub struct Compressor {
    executor: RemoteExecutor,
}

impl Compressor {
    pub fn new(executor: RemoteExecutor) -> Self {
        Self { executor }
    }

    /// Picks the remote path for a new archive of `folder_path`.
    pub fn next_archive_path(&self, folder_path: &str, kind: CompressionKind) -> String {
        archive_path(folder_path, kind, Utc::now().timestamp_millis())
    }

    /// Writes `archive`. On failure a partial archive may remain at that path.
    pub async fn compress_folder(
        &self,
        target: &ConnectionTarget,
        folder_path: &str,
        archive: &str,
        kind: CompressionKind,
    ) -> Result<()> {
        info!("[{}] Compressing {} to {}", target.host, folder_path, archive);

        self.executor
            .run(target, &compress_command(folder_path, archive, kind))
            .await?;

        debug!("[{}] Archive ready: {}", target.host, archive);
        Ok(())
    }

    /// Never fails; a leftover archive is logged and left behind.
    pub async fn delete_remote_file(&self, target: &ConnectionTarget, path: &str) {
        let command = format!("rm -f {}", shell_quote(path));
        let removed = best_effort("Remote archive cleanup", async {
            self.executor.run(target, &command).await.map(|_| ())
        })
        .await;

        if removed.is_some() {
            info!("[{}] Removed remote archive {}", target.host, path);
        }
    }
}

pub fn calculate_sha256(file_path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut reader = BufReader::new(File::open(file_path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{target, FakeTransport};
    use std::time::Duration;
    use tempfile::tempdir;

    fn compressor(fake: &FakeTransport) -> Compressor {
        Compressor::new(RemoteExecutor::new(
            fake.clone().into_transport(),
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn test_archive_path_is_deterministic() {
        assert_eq!(
            archive_path("/var/www/uploads/", CompressionKind::Zip, 1700000000123),
            "/tmp/uploads_1700000000123.zip"
        );
        assert_eq!(
            archive_path("/srv/My Site", CompressionKind::TarGz, 5),
            "/tmp/My_Site_5.tar.gz"
        );
    }

    #[test]
    fn test_commands_run_at_low_priority() {
        let zip = compress_command("/var/www/uploads", "/tmp/uploads_1.zip", CompressionKind::Zip);
        assert_eq!(
            zip,
            "cd '/var/www' && nice -n 19 zip -rq '/tmp/uploads_1.zip' 'uploads'"
        );

        let tar = compress_command("/var/www/uploads", "/tmp/uploads_1.tar.gz", CompressionKind::TarGz);
        assert_eq!(
            tar,
            "nice -n 19 tar -czf '/tmp/uploads_1.tar.gz' -C '/var/www' 'uploads'"
        );
    }

    #[tokio::test]
    async fn test_compress_folder_creates_archive() {
        let fake = FakeTransport::new();
        let compressor = compressor(&fake);
        let archive = compressor.next_archive_path("/var/www/uploads", CompressionKind::Zip);
        compressor
            .compress_folder(&target("web"), "/var/www/uploads", &archive, CompressionKind::Zip)
            .await
            .unwrap();

        assert!(archive.starts_with("/tmp/uploads_"));
        assert!(archive.ends_with(".zip"));
        assert!(fake.has_file(&archive));
    }

    #[tokio::test]
    async fn test_compression_failure_propagates() {
        let fake = FakeTransport::new();
        fake.fail_commands_containing("nice -n 19");
        let err = compressor(&fake)
            .compress_folder(
                &target("web"),
                "/var/www/uploads",
                "/tmp/uploads_1.tar.gz",
                CompressionKind::TarGz,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 1"));
    }

    #[tokio::test]
    async fn test_delete_swallows_failures() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/a.zip", b"x");
        fake.fail_commands_containing("rm -f");
        compressor(&fake).delete_remote_file(&target("web"), "/tmp/a.zip").await;
        assert!(fake.has_file("/tmp/a.zip"));

        let down = FakeTransport::new();
        down.mark_unreachable("web");
        compressor(&down).delete_remote_file(&target("web"), "/tmp/a.zip").await;
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let fake = FakeTransport::new();
        fake.add_file("/tmp/a.zip", b"x");
        compressor(&fake).delete_remote_file(&target("web"), "/tmp/a.zip").await;
        assert!(!fake.has_file("/tmp/a.zip"));
    }

    #[test]
    fn test_calculate_sha256() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("archive.zip");
        std::fs::write(&file_path, b"hello world").unwrap();

        assert_eq!(
            calculate_sha256(&file_path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
