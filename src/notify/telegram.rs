//! Telegram Bot API notification channel.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::{Channel, Notice};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub chat_id: String,
}

pub struct TelegramNotifier {
    config: TelegramConfig,
    client: Mutex<Option<reqwest::Client>>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<reqwest::Client> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("build telegram client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl Channel for TelegramNotifier {
    async fn send(&self, notice: Notice) -> Result<()> {
        if self.config.token.is_empty() || self.config.chat_id.is_empty() {
            return Err(Error::bad_request("telegram token or chat id not configured"));
        }
        let client = self.client().await?;
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.config.token);
        let response = client
            .post(url)
            .json(&serde_json::json!({
                "chat_id": self.config.chat_id,
                "text": format!("*{}*\n{}", notice.title, notice.body),
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "telegram send failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
