mod discord;

pub use discord::DiscordNotifier;

use crate::config::NotificationConfig;
use crate::error::Result;
use crate::upload::StrategyKind;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct SuccessNotice {
    pub server_name: String,
    pub size_mb: f64,
    pub duration_secs: f64,
    pub local_path: Option<String>,
    pub cloud_uploaded: bool,
    pub strategy_used: Option<StrategyKind>,
    pub folder_name: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailureNotice {
    pub server_name: String,
    pub error_message: String,
    pub duration_secs: f64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_success(&self, notice: &SuccessNotice) -> Result<()>;
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<()>;
    fn name(&self) -> &'static str;
}

pub fn create_notifiers(config: &NotificationConfig) -> Result<Vec<Box<dyn Notifier>>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

    if let Some(discord) = &config.discord {
        notifiers.push(Box::new(DiscordNotifier::new(discord)?));
    }

    Ok(notifiers)
}
