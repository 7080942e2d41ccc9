use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    #[default]
    Zip,
    TarGz,
}

impl CompressionKind {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionKind::Zip => "zip",
            CompressionKind::TarGz => "tar.gz",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            CompressionKind::Zip => "application/zip",
            CompressionKind::TarGz => "application/gzip",
        }
    }

    /// Binaries the remote host needs to build this archive.
    pub fn required_tools(&self) -> &'static [&'static str] {
        match self {
            CompressionKind::Zip => &["zip"],
            CompressionKind::TarGz => &["tar", "gzip"],
        }
    }
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionKind::Zip => write!(f, "zip"),
            CompressionKind::TarGz => write!(f, "tar.gz"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    Password {
        password: String,
    },
    PrivateKey {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl ConnectionTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    #[default]
    Direct,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloudUploadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub upload_method: UploadMethod,
    #[serde(default)]
    pub destination_folder_id: Option<String>,
    #[serde(default)]
    pub credentials_ref: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub remote_directory: String,
    #[serde(default)]
    pub target_subfolder: String,
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub cloud: CloudUploadConfig,
}

fn default_rclone_threshold_mb() -> u64 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub credentials_file: PathBuf,
    #[serde(default)]
    pub default_folder_id: Option<String>,
    /// rclone remote configured on the backed-up hosts, e.g. `gdrive`.
    #[serde(default)]
    pub rclone_remote: Option<String>,
    #[serde(default = "default_rclone_threshold_mb")]
    pub large_file_threshold_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub chunk_size_kb: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            concurrency: None,
            chunk_size_kb: None,
            max_retries: None,
            retry_delay_secs: None,
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub drive: Option<DriveConfig>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default = "default_backup_dir")]
    pub local_backup_dir: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_backups: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            drive: None,
            notifications: NotificationConfig::default(),
            transfer: TransferSettings::default(),
            local_backup_dir: default_backup_dir(),
            max_concurrent_backups: default_max_concurrent(),
        }
    }
}

/// Caller-side overrides for the transfer engine. `None` means "use the size tier".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferOverrides {
    pub concurrency: Option<usize>,
    pub chunk_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

/// Everything one job needs, resolved up front and never re-read mid-run.
#[derive(Debug, Clone)]
pub struct BackupJobConfig {
    pub server_name: String,
    pub target: ConnectionTarget,
    pub remote_directory: String,
    pub target_subfolder: String,
    pub compression: CompressionKind,
    pub local_root: PathBuf,
    pub cloud: CloudUploadConfig,
    pub connect_timeout: Duration,
    pub transfer: TransferOverrides,
}

impl BackupJobConfig {
    pub fn local_dir(&self) -> PathBuf {
        if self.target_subfolder.is_empty() {
            self.local_root.join(&self.server_name)
        } else {
            self.local_root.join(&self.target_subfolder)
        }
    }
}
