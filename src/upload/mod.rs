mod drive;
mod folders;
mod resolver;
mod strategies;

#[cfg(test)]
pub mod testing;

pub use drive::{DriveClient, DriveProvider};
pub use folders::FolderRegistry;
pub use resolver::{UploadResolver, UploadSettings};

use crate::config::CloudUploadConfig;
use crate::error::Result;
use crate::transfer::{GB, KB, MB};
use async_trait::async_trait;
use serde::Serialize;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Parameters for one streamed upload into the cloud store.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub name: String,
    pub mime_type: String,
    pub folder_id: String,
    pub size: u64,
    pub chunk_size: usize,
    pub timeout: Duration,
    /// Retries per chunk, transient failures only.
    pub max_retries: u32,
}

impl UploadRequest {
    /// Chunking and patience scaled to the object size.
    pub fn tuned(name: &str, mime_type: &str, folder_id: &str, size: u64) -> Self {
        let chunk_kb = if size < 100 * MB {
            256
        } else if size < GB {
            1024
        } else if size < 5 * GB {
            2048
        } else {
            4096
        };
        let (timeout_mins, max_retries) = if size >= 5 * GB { (30, 10) } else { (15, 5) };

        Self {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            folder_id: folder_id.to_string(),
            size,
            chunk_size: chunk_kb * KB as usize,
            timeout: Duration::from_secs(timeout_mins * 60),
            max_retries,
        }
    }
}

#[async_trait]
pub trait CloudStore: Send + Sync {
    async fn find_folder(&self, name: &str, parent_id: Option<&str>) -> Result<Option<String>>;

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String>;

    /// Consumes `source` until `request.size` bytes are sent. Returns the object id.
    async fn upload_stream(
        &self,
        source: Box<dyn Read + Send>,
        request: &UploadRequest,
    ) -> Result<String>;

    async fn test_connection(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Hands out a store bound to one job's credentials.
pub trait CloudProvider: Send + Sync {
    fn store_for(&self, cloud: &CloudUploadConfig) -> Result<Arc<dyn CloudStore>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RemoteCli,
    OptimizedStream,
    ChunkedStream,
    LocalRelay,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StrategyKind::RemoteCli => "remote_cli",
            StrategyKind::OptimizedStream => "optimized_stream",
            StrategyKind::ChunkedStream => "chunked_stream",
            StrategyKind::LocalRelay => "local_relay",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub cloud_object_id: String,
    pub destination_folder_name: String,
    pub strategy_used: StrategyKind,
    pub upload_duration_secs: f64,
    pub byte_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tuning_scales_with_size() {
        let small = UploadRequest::tuned("a.zip", "application/zip", "f", 10 * MB);
        assert_eq!(small.chunk_size, 256 * 1024);
        assert_eq!(small.max_retries, 5);
        assert_eq!(small.timeout, Duration::from_secs(15 * 60));

        let huge = UploadRequest::tuned("a.zip", "application/zip", "f", 8 * GB);
        assert_eq!(huge.chunk_size, 4 * 1024 * 1024);
        assert_eq!(huge.max_retries, 10);
        assert_eq!(huge.timeout, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_chunk_sizes_are_resumable_aligned() {
        for size in [0, MB, 500 * MB, 2 * GB, 20 * GB] {
            let request = UploadRequest::tuned("a", "b", "c", size);
            assert_eq!(request.chunk_size % (256 * 1024), 0);
        }
    }

    #[test]
    fn test_strategy_labels() {
        assert_eq!(StrategyKind::RemoteCli.to_string(), "remote_cli");
        assert_eq!(StrategyKind::LocalRelay.to_string(), "local_relay");
    }
}
