//! qBittorrent Web API implementation of the downloader interface.
//!
//! Authentication is lazy: the first call logs in (cookie session) and
//! creates the scoping tag if the client doesn't have it yet.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::{DownloadStatus, Downloader, TorrentStatus, CLIENT_TAG};

const METADATA_POLL_INTERVAL: Duration = Duration::from_millis(500);
const METADATA_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QbittorrentConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

pub struct Qbittorrent {
    client: reqwest::Client,
    config: QbittorrentConfig,
    logged_in: Mutex<bool>,
}

#[derive(Debug, Deserialize)]
struct QbTorrent {
    hash: String,
    name: String,
    progress: f64,
    dlspeed: i64,
    state: String,
    amount_left: i64,
    total_size: i64,
    added_on: i64,
    completion_on: i64,
}

#[derive(Debug, Deserialize)]
struct QbProperties {
    #[serde(default)]
    name: String,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Deserialize)]
struct QbFile {
    name: String,
}

impl Qbittorrent {
    pub fn new(config: QbittorrentConfig) -> Self {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("build qbittorrent http client");
        Self {
            client,
            config,
            logged_in: Mutex::new(false),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2{path}", self.config.host.trim_end_matches('/'))
    }

    async fn init(&self) -> Result<()> {
        let mut logged_in = self.logged_in.lock().await;
        if *logged_in {
            return Ok(());
        }
        self.login().await?;
        self.ensure_tag().await?;
        *logged_in = true;
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        let response = self
            .client
            .post(self.url("/auth/login"))
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || body.trim() == "Fails." {
            return Err(Error::upstream(
                "qbittorrent login failed; check the configured username and password",
            ));
        }
        Ok(())
    }

    async fn ensure_tag(&self) -> Result<()> {
        let tags: String = self
            .client
            .get(self.url("/torrents/tags"))
            .send()
            .await?
            .text()
            .await
            .unwrap_or_default();
        let exists = serde_json::from_str::<Vec<String>>(&tags)
            .map(|tags| tags.iter().any(|t| t == CLIENT_TAG))
            .unwrap_or(false);
        if !exists {
            self.post_form("/torrents/createTags", &[("tags", CLIENT_TAG)])
                .await?;
        }
        Ok(())
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<()> {
        let response = self.client.post(self.url(path)).form(form).send().await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "qbittorrent request {path} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn properties(&self, hash: &str) -> Result<QbProperties> {
        let response = self
            .client
            .get(self.url("/torrents/properties"))
            .query(&[("hash", hash)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "fetch torrent properties failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn torrents(&self, query: &[(&str, &str)]) -> Result<Vec<QbTorrent>> {
        let response = self
            .client
            .get(self.url("/torrents/info"))
            .query(query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "list torrents failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn convert(&self, torrents: Vec<QbTorrent>) -> Vec<DownloadStatus> {
        let mut statuses = Vec::with_capacity(torrents.len());
        for t in torrents {
            let mut status = DownloadStatus {
                hash: t.hash,
                name: t.name,
                progress: t.progress,
                download_speed: t.dlspeed,
                status: TorrentStatus::Downloading,
                error: String::new(),
                cost: Duration::ZERO,
                size: t.total_size,
            };
            match t.state.as_str() {
                "error" | "missingFiles" => {
                    status.status = TorrentStatus::DownloadError;
                    if let Ok(props) = self.properties(&status.hash).await {
                        status.error = props.comment;
                    }
                }
                "stoppedDL" | "pausedDL" => {
                    status.status = TorrentStatus::DownloadPaused;
                }
                state if t.amount_left == 0 && state != "moving" => {
                    status.status = TorrentStatus::Downloaded;
                    status.cost =
                        Duration::from_secs((t.completion_on - t.added_on).max(0) as u64);
                }
                _ => {}
            }
            statuses.push(status);
        }
        statuses
    }
}

/// One-shot connectivity probe for candidate configurations.
pub async fn check_connection(config: QbittorrentConfig) -> Result<()> {
    Qbittorrent::new(config).login().await
}

#[async_trait::async_trait]
impl Downloader for Qbittorrent {
    async fn add_torrent(
        &self,
        torrent_link: &str,
        save_path: &str,
        stop_condition: &str,
    ) -> Result<()> {
        self.init().await?;
        let mut form = vec![
            ("urls", torrent_link),
            ("savepath", save_path),
            ("tags", CLIENT_TAG),
        ];
        if !stop_condition.is_empty() {
            form.push(("stopCondition", stop_condition));
        }
        self.post_form("/torrents/add", &form).await
    }

    async fn set_location(&self, hash: &str, save_path: &str) -> Result<()> {
        self.init().await?;
        // Adopt foreign torrents into our tag scope before moving them.
        self.post_form("/torrents/addTags", &[("hashes", hash), ("tags", CLIENT_TAG)])
            .await?;
        self.post_form(
            "/torrents/setLocation",
            &[("hashes", hash), ("location", save_path)],
        )
        .await
    }

    async fn get_torrent_name(&self, hash: &str) -> Result<String> {
        self.init().await?;
        let deadline = tokio::time::Instant::now() + METADATA_POLL_TIMEOUT;
        loop {
            match self.properties(hash).await {
                Ok(props) if !props.name.is_empty() && props.name != hash => {
                    return Ok(props.name);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(hash, error = %err, "torrent properties not ready yet");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::upstream(format!(
                    "timed out waiting for metadata of torrent {hash}"
                )));
            }
            tokio::time::sleep(METADATA_POLL_INTERVAL).await;
        }
    }

    async fn get_torrent_file_names(&self, hash: &str) -> Result<Vec<String>> {
        self.init().await?;
        let response = self
            .client
            .get(self.url("/torrents/files"))
            .query(&[("hash", hash)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "fetch torrent files failed with status {}",
                response.status()
            )));
        }
        let files: Vec<QbFile> = response.json().await?;
        Ok(files.into_iter().map(|f| f.name).collect())
    }

    async fn continue_download(&self, hash: &str) -> Result<()> {
        self.init().await?;
        self.post_form("/torrents/resume", &[("hashes", hash)]).await
    }

    async fn delete_torrent(&self, hash: &str) -> Result<()> {
        self.init().await?;
        self.post_form(
            "/torrents/delete",
            &[("hashes", hash), ("deleteFiles", "true")],
        )
        .await
    }

    async fn get_download_statuses(&self, hashes: &[String]) -> Result<Vec<DownloadStatus>> {
        self.init().await?;
        let joined = hashes.join("|");
        let mut query = Vec::new();
        if !joined.is_empty() {
            query.push(("hashes", joined.as_str()));
        }
        let torrents = self.torrents(&query).await?;
        Ok(self.convert(torrents).await)
    }

    async fn list_torrents_status(&self) -> Result<Vec<DownloadStatus>> {
        self.init().await?;
        let torrents = self
            .torrents(&[("filter", "all"), ("tag", CLIENT_TAG)])
            .await?;
        Ok(self.convert(torrents).await)
    }
}
