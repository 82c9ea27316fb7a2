//! Target-change notifications

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NotifierConfig;
use crate::types::TargetResource;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce a new target. `Ok(false)` when nothing was sent.
    async fn notify_target_changed(
        &self,
        target: &TargetResource,
        page_url: &str,
    ) -> anyhow::Result<bool>;
}

/// Fire-and-forget delivery; failures are only logged
pub fn dispatch(
    notifier: Arc<dyn Notifier>,
    target: TargetResource,
    page_url: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.notify_target_changed(&target, &page_url).await {
            Ok(true) => info!("Notification sent for target {}", target.resource_id),
            Ok(false) => debug!("No notification sent for target {}", target.resource_id),
            Err(e) => warn!("Failed to notify about target {}: {}", target.resource_id, e),
        }
    })
}

/// HTML message body for a target change
pub fn format_target_message(target: &TargetResource, page_url: &str, time: &str) -> String {
    let members = if target.members.is_empty() {
        "\nNobody in the club has it".to_string()
    } else {
        let names: Vec<&str> = target.members.iter().map(|m| m.username.as_str()).collect();
        format!("\nOwned by: {}", names.join(", "))
    };
    let name = if target.name.is_empty() { "Unknown" } else { &target.name };

    format!(
        "<b>🎴 Target changed</b>\n🕐 {}\n<a href='{}'>{}</a>\n\n📝 <b>{}</b>\n🆔 ID: {} | Rank: {}\n👥 Owners: {} | Wanted by: {}{}",
        time,
        page_url,
        page_url,
        name,
        target.resource_id,
        target.rank,
        target.owner_count,
        target.demand_count,
        members
    )
}

/// Telegram Bot API `sendMessage`, at most once per target per day
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    chat_id: String,
    thread_id: Option<i64>,
    sent: Mutex<HashMap<u64, NaiveDate>>,
}

impl TelegramNotifier {
    /// `None` unless both token and chat are configured
    pub fn from_config(cfg: &NotifierConfig) -> anyhow::Result<Option<Self>> {
        match (&cfg.telegram_token, &cfg.chat_id) {
            (Some(token), Some(chat_id)) if cfg.is_configured() => {
                Ok(Some(Self::new(TELEGRAM_API, token, chat_id, cfg.thread_id)?))
            }
            _ => Ok(None),
        }
    }

    pub fn new(
        api_base: &str,
        token: &str,
        chat_id: &str,
        thread_id: Option<i64>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            api_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
            chat_id: chat_id.to_string(),
            thread_id,
            sent: Mutex::new(HashMap::new()),
        })
    }

    fn already_sent_today(&self, resource_id: u64, today: NaiveDate) -> bool {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&resource_id)
            .is_some_and(|day| *day == today)
    }

    pub async fn send_message(&self, text: &str) -> anyhow::Result<Option<i64>> {
        let mut payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": false,
        });
        if let Some(thread_id) = self.thread_id {
            payload["message_thread_id"] = thread_id.into();
        }

        let response = self
            .client
            .post(format!("{}/sendMessage", self.api_url))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Telegram API error: {} - {}", status, body));
        }

        let body: serde_json::Value = response.json().await?;
        Ok(body["result"]["message_id"].as_i64())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_target_changed(
        &self,
        target: &TargetResource,
        page_url: &str,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let today = now.date_naive();
        if self.already_sent_today(target.resource_id, today) {
            info!("Target {} was already announced today", target.resource_id);
            return Ok(false);
        }

        let text = format_target_message(target, page_url, &now.format("%H:%M:%S").to_string());
        let message_id = self.send_message(&text).await?;
        debug!("Telegram message id: {:?}", message_id);

        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target.resource_id, today);
        Ok(true)
    }
}
