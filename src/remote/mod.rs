//! Remote shell and file-transfer plumbing.
//!
//! Everything above this module talks to a [`Transport`], which hands out one
//! blocking [`RemoteSession`] per call. Sessions are never pooled: each
//! command or transfer opens its own and drops it when done.

mod executor;
mod probe;
pub mod ssh;

#[cfg(test)]
pub mod testing;

pub use crate::config::{ConnectionTarget, Credential};
pub use executor::RemoteExecutor;
pub use probe::RemoteProbe;

use crate::error::Result;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Connection tuning for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProfile {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Missed keepalive probes tolerated before the session is declared dead.
    pub keepalive_max_misses: u32,
}

impl SessionProfile {
    pub fn standard(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive_interval: Duration::from_secs(15),
            keepalive_max_misses: 4,
        }
    }

    /// Probes more often but tolerates far longer silence, for multi-GB copies.
    pub fn large_file(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive_interval: Duration::from_secs(5),
            keepalive_max_misses: 24,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.keepalive_interval * self.keepalive_max_misses
    }
}

/// Parameters for one chunked copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPlan {
    pub concurrency: usize,
    pub chunk_size: usize,
}

/// Called with `(bytes_done, bytes_total)` after every chunk.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn connect(
        &self,
        target: &ConnectionTarget,
        profile: &SessionProfile,
    ) -> Result<Box<dyn RemoteSession>>;
}

pub trait RemoteSession: Send {
    /// Re-applies keepalive and liveness settings to an open session.
    fn tune(&mut self, profile: &SessionProfile);

    fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    fn stat_size(&mut self, path: &str) -> Result<u64>;

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Remote to local. Returns bytes written.
    fn fast_get(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        plan: CopyPlan,
        progress: ProgressFn,
    ) -> Result<u64>;

    /// Local to remote. Returns bytes written.
    fn fast_put(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        plan: CopyPlan,
        progress: ProgressFn,
    ) -> Result<u64>;
}

/// Opens a session on the blocking pool.
pub async fn connect(
    transport: &Arc<dyn Transport>,
    target: &ConnectionTarget,
    profile: &SessionProfile,
) -> Result<Box<dyn RemoteSession>> {
    let transport = transport.clone();
    let target = target.clone();
    let profile = profile.clone();
    tokio::task::spawn_blocking(move || transport.connect(&target, &profile)).await?
}

/// A remote file opened for streaming. Dropping it closes the handle and
/// then the session that owns it.
pub struct RemoteReadStream {
    reader: Box<dyn Read + Send>,
    size: u64,
    _session: Box<dyn RemoteSession>,
}

impl RemoteReadStream {
    pub fn new(reader: Box<dyn Read + Send>, size: u64, session: Box<dyn RemoteSession>) -> Self {
        Self {
            reader,
            size,
            _session: session,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for RemoteReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}
