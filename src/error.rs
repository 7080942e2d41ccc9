use std::future::Future;
use std::io;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Remote command failed (exit code {exit_code}): {stderr}")]
    RemoteCommand { exit_code: i32, stderr: String },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Cloud storage error: {message}")]
    Cloud {
        status: Option<u16>,
        message: String,
        transient: bool,
    },

    #[error("Upload strategy unavailable: {0}")]
    StrategyUnavailable(String),

    #[error("All upload strategies failed (tried: {attempted}); last error: {last}")]
    UploadChainExhausted {
        attempted: String,
        last: Box<BackupError>,
    },

    #[error("Remote directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Missing required tools on remote host: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Background task error: {0}")]
    Task(String),
}

impl BackupError {
    pub fn cloud(status: Option<u16>, message: impl Into<String>) -> Self {
        let transient = status.map_or(false, is_transient_status);
        BackupError::Cloud {
            status,
            message: message.into(),
            transient,
        }
    }

    /// Timeouts, rate limits and server-side errors. Everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            BackupError::Cloud { transient, .. } => *transient,
            BackupError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, BackupError::Connection(_))
    }
}

pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for BackupError {
    fn from(err: toml::ser::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let transient =
            err.is_timeout() || err.is_connect() || status.map_or(false, is_transient_status);
        BackupError::Cloud {
            status,
            message: err.to_string(),
            transient,
        }
    }
}

impl From<ssh2::Error> for BackupError {
    fn from(err: ssh2::Error) -> Self {
        BackupError::Connection(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackupError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Runs a cleanup-style operation whose failure must never replace the
/// caller's own outcome. Failures are logged and dropped.
pub async fn best_effort<T, F>(what: &str, operation: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match operation.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} failed (ignored): {}", what, e);
            None
        }
    }
}
