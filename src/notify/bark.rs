//! Bark (iOS push) notification channel.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::{Channel, Notice};

fn default_server() -> String {
    "https://api.day.app".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarkConfig {
    #[serde(default = "default_server")]
    pub server_url: String,
    #[serde(default)]
    pub device_key: String,
}

impl Default for BarkConfig {
    fn default() -> Self {
        Self {
            server_url: default_server(),
            device_key: String::new(),
        }
    }
}

pub struct BarkNotifier {
    config: BarkConfig,
    client: Mutex<Option<reqwest::Client>>,
}

impl BarkNotifier {
    pub fn new(config: BarkConfig) -> Self {
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
            .map_err(|e| Error::Internal(anyhow::anyhow!("build bark client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl Channel for BarkNotifier {
    async fn send(&self, notice: Notice) -> Result<()> {
        if self.config.device_key.is_empty() {
            return Err(Error::bad_request("bark device key not configured"));
        }
        let client = self.client().await?;
        let url = format!("{}/push", self.config.server_url.trim_end_matches('/'));
        let response = client
            .post(url)
            .json(&serde_json::json!({
                "title": notice.title,
                "body": notice.body,
                "device_key": self.config.device_key,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "bark send failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
