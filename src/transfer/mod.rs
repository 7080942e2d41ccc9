//! Size-adaptive, retrying file transfer over the remote transport.

mod engine;

pub use engine::TransferEngine;

use crate::config::TransferOverrides;
use crate::error::{BackupError, Result};
use crate::remote::CopyPlan;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

/// Above this a copy counts as a large-file transfer.
pub const LARGE_FILE_BYTES: u64 = GB;

/// Copy parameters for one size bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTier {
    pub concurrency: usize,
    pub chunk_size: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Pure function of the byte size.
pub fn select_tier(size: u64) -> TransferTier {
    let (concurrency, chunk_kb, max_attempts, delay_secs) = if size < 100 * MB {
        (32, 64, 3, 2)
    } else if size < GB {
        (64, 128, 3, 3)
    } else if size < 5 * GB {
        (96, 256, 5, 5)
    } else if size < 10 * GB {
        (128, 512, 8, 8)
    } else {
        (160, 1024, 10, 10)
    };

    TransferTier {
        concurrency,
        chunk_size: chunk_kb * KB as usize,
        max_attempts,
        retry_delay: Duration::from_secs(delay_secs),
    }
}

/// The tier with any caller overrides applied on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub copy: CopyPlan,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub large_file: bool,
}

impl TransferPlan {
    pub fn resolve(size: u64, overrides: &TransferOverrides) -> Self {
        let tier = select_tier(size);
        Self {
            copy: CopyPlan {
                concurrency: overrides.concurrency.unwrap_or(tier.concurrency).max(1),
                chunk_size: overrides.chunk_size.unwrap_or(tier.chunk_size).max(1),
            },
            max_attempts: overrides.max_retries.unwrap_or(tier.max_attempts).max(1),
            retry_delay: overrides.retry_delay.unwrap_or(tier.retry_delay),
            large_file: size >= LARGE_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub overrides: TransferOverrides,
    /// Latest progress, overwritten on every chunk. Readers poll it.
    pub progress: Option<Arc<watch::Sender<TransferProgress>>>,
}

impl TransferOptions {
    pub fn with_overrides(overrides: TransferOverrides) -> Self {
        Self {
            overrides,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub path: String,
    pub byte_size: u64,
    pub duration_secs: f64,
    pub average_mbps: f64,
    pub attempts: u32,
    pub success: bool,
    pub error_detail: Option<String>,
}

impl TransferResult {
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(BackupError::Transfer(
                self.error_detail
                    .unwrap_or_else(|| format!("transfer of {} failed", self.path)),
            ))
        }
    }
}

pub fn throughput_mbps(bytes: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64().max(0.001);
    bytes as f64 / MB as f64 / secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_table() {
        let cases = [
            (0, 32, 64),
            (100 * MB - 1, 32, 64),
            (100 * MB, 64, 128),
            (GB - 1, 64, 128),
            (GB, 96, 256),
            (2 * GB, 96, 256),
            (5 * GB, 128, 512),
            (10 * GB - 1, 128, 512),
            (10 * GB, 160, 1024),
            (500 * GB, 160, 1024),
        ];
        for (size, concurrency, chunk_kb) in cases {
            let tier = select_tier(size);
            assert_eq!(tier.concurrency, concurrency, "concurrency for {size}");
            assert_eq!(tier.chunk_size, chunk_kb * 1024, "chunk size for {size}");
        }
    }

    #[test]
    fn test_large_tiers_retry_more() {
        assert_eq!(select_tier(MB).max_attempts, 3);
        assert!(select_tier(2 * GB).max_attempts >= 5);
        assert!(select_tier(20 * GB).max_attempts <= 10);
        assert!(select_tier(20 * GB).retry_delay > select_tier(MB).retry_delay);
    }

    #[test]
    fn test_overrides_win_only_when_supplied() {
        let plan = TransferPlan::resolve(2 * GB, &TransferOverrides::default());
        assert_eq!(plan.copy.concurrency, 96);
        assert_eq!(plan.copy.chunk_size, 256 * 1024);
        assert!(plan.large_file);

        let overrides = TransferOverrides {
            concurrency: Some(8),
            chunk_size: None,
            max_retries: Some(1),
            retry_delay: Some(Duration::ZERO),
        };
        let plan = TransferPlan::resolve(2 * GB, &overrides);
        assert_eq!(plan.copy.concurrency, 8);
        assert_eq!(plan.copy.chunk_size, 256 * 1024);
        assert_eq!(plan.max_attempts, 1);
        assert_eq!(plan.retry_delay, Duration::ZERO);
    }

    #[test]
    fn test_failed_result_converts_to_transfer_error() {
        let result = TransferResult {
            path: "/tmp/a.zip".to_string(),
            byte_size: 10,
            duration_secs: 1.0,
            average_mbps: 0.0,
            attempts: 3,
            success: false,
            error_detail: Some("simulated copy failure".to_string()),
        };
        let err = result.into_result().unwrap_err();
        assert!(err.to_string().contains("simulated copy failure"));
    }
}
