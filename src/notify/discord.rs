use super::{FailureNotice, Notifier, SuccessNotice};
use crate::config::DiscordConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Discord rejects message content above this many characters.
const MAX_CONTENT_LEN: usize = 2000;

#[derive(Debug, Serialize)]
struct WebhookMessage {
    username: &'static str,
    content: String,
}

pub struct DiscordNotifier {
    webhook_url: String,
    client: Client,
}

fn truncate(content: String) -> String {
    if content.chars().count() <= MAX_CONTENT_LEN {
        return content;
    }
    let mut cut: String = content.chars().take(MAX_CONTENT_LEN - 3).collect();
    cut.push_str("...");
    cut
}

fn success_message(notice: &SuccessNotice) -> String {
    let mut message = format!(
        "**Server Backup Completed**\n\n\
         🖥️ **Server:** `{}`\n\
         🕐 **Timestamp:** {}\n\
         📊 **Archive Size:** {:.2} MB\n\
         ⏱️ **Duration:** {:.1} seconds\n",
        notice.server_name,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        notice.size_mb,
        notice.duration_secs
    );

    if let Some(path) = &notice.local_path {
        message.push_str(&format!("📁 **Saved To:** `{}`\n", path));
    }
    if let Some(hash) = &notice.sha256 {
        message.push_str(&format!("🔐 **SHA256:** `{}`\n", hash));
    }
    if notice.cloud_uploaded {
        message.push_str(&format!(
            "☁️ **Cloud Folder:** `{}`\n🚚 **Strategy:** `{}`\n",
            notice.folder_name.as_deref().unwrap_or("N/A"),
            notice
                .strategy_used
                .map(|s| s.to_string())
                .unwrap_or_else(|| "N/A".to_string())
        ));
    }
    message.push_str("✅ **Status:** Success");
    truncate(message)
}

fn failure_message(notice: &FailureNotice) -> String {
    truncate(format!(
        "**Server Backup Failed**\n\n\
         🖥️ **Server:** `{}`\n\
         🕐 **Timestamp:** {}\n\
         ⏱️ **Duration:** {:.1} seconds\n\
         ❗ **Error:** {}\n\
         ❌ **Status:** Failed",
        notice.server_name,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        notice.duration_secs,
        notice.error_message
    ))
}

impl DiscordNotifier {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        if !config.webhook_url.starts_with("https://") {
            return Err(BackupError::Config(
                "Discord webhook URL must start with https://".to_string(),
            ));
        }

        let client = Client::builder()
            .user_agent("TLM-Remote-Backup/1.0")
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            client,
        })
    }

    async fn post(&self, content: String) -> Result<()> {
        let body = WebhookMessage {
            username: "TLM Backup",
            content,
        };

        let response = self.client.post(&self.webhook_url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BackupError::Notify(format!(
                "Discord webhook rejected message: {} - {}",
                status, text
            )));
        }

        debug!("Discord webhook accepted message");
        Ok(())
    }

    pub async fn send_test_message(&self) -> Result<()> {
        info!("Sending Discord test message...");
        self.post("🔔 TLM Remote Backup notification test".to_string())
            .await?;
        info!("Discord test message delivered");
        Ok(())
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify_success(&self, notice: &SuccessNotice) -> Result<()> {
        self.post(success_message(notice)).await
    }

    async fn notify_failure(&self, notice: &FailureNotice) -> Result<()> {
        self.post(failure_message(notice)).await
    }

    fn name(&self) -> &'static str {
        "Discord Webhook"
    }
}
