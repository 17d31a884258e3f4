//! Download manager: owns the torrent lifecycle state machine and the
//! 1-minute reconciliation loop against the external client.
//!
//! Per-torrent status updates run in parallel within a tick and the tick
//! awaits all of them, bounding fan-out to the client's torrent count.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::db::torrents::SetTorrentStatusOptions;
use crate::db::TorrentRepository;
use crate::error::{Error, Result};
use crate::notify::{DownloadedNotice, Notifier};

use super::{DownloadReq, DownloadStatus, DownloadType, Downloader, Torrent, TorrentStatus};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Torrent added stopped; flips to `downloadPaused` once metadata arrives.
const STOP_CONDITION_METADATA: &str = "MetadataReceived";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadManagerConfig {
    #[serde(default)]
    pub tv_save_path: String,
    #[serde(default)]
    pub movie_save_path: String,
}

pub struct DownloadManager {
    downloader: Arc<dyn Downloader>,
    torrents: TorrentRepository,
    notifier: Arc<dyn Notifier>,
    config: RwLock<DownloadManagerConfig>,
    stop: watch::Sender<bool>,
}

impl DownloadManager {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        torrents: TorrentRepository,
        notifier: Arc<dyn Notifier>,
        config: DownloadManagerConfig,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            downloader,
            torrents,
            notifier,
            config: RwLock::new(config),
            stop,
        })
    }

    /// Spawns the reconciliation loop.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + RECONCILE_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, RECONCILE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.check_download_status().await,
                    _ = stop.changed() => return,
                }
            }
        });
    }

    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    /// Public entry point: add the torrent if unknown, otherwise move it to
    /// the requested save path, then persist the observed state.
    pub async fn download(&self, req: DownloadReq) -> Result<()> {
        let statuses = self
            .downloader
            .get_download_statuses(std::slice::from_ref(&req.hash))
            .await?;
        if statuses.is_empty() {
            return self.add_new_torrent(req).await;
        }

        let save_path = self.save_path(&req);
        self.downloader.set_location(&req.hash, &save_path).await?;

        let statuses = self
            .downloader
            .get_download_statuses(std::slice::from_ref(&req.hash))
            .await?;
        let status = statuses
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream("torrent vanished after relocation"))?;

        let mut torrent = self.torrent_from_req(&req, save_path, status.name);
        torrent.status = status.status;
        if status.status == TorrentStatus::DownloadError {
            torrent.status_detail = status.error;
        }
        self.torrents.save(&torrent).await
    }

    async fn add_new_torrent(&self, req: DownloadReq) -> Result<()> {
        if req.torrent_link.is_empty() {
            return Err(Error::bad_request("no torrent link provided"));
        }
        let save_path = self.save_path(&req);
        let stop_condition = if req.not_start {
            STOP_CONDITION_METADATA
        } else {
            ""
        };
        self.downloader
            .add_torrent(&req.torrent_link, &save_path, stop_condition)
            .await?;

        let name = self.downloader.get_torrent_name(&req.hash).await?;
        let torrent = self.torrent_from_req(&req, save_path, name);
        self.torrents.save(&torrent).await
    }

    fn torrent_from_req(&self, req: &DownloadReq, save_path: String, name: String) -> Torrent {
        Torrent {
            hash: req.hash.clone(),
            name,
            path: save_path,
            status: TorrentStatus::Downloading,
            status_detail: String::new(),
            subscription_id: req.subscription_id.clone(),
            task_id: req.task_id.clone(),
            transfer_type: String::new(),
            rss_guid: req.rss_guid.clone(),
            file_names: Vec::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn save_path(&self, req: &DownloadReq) -> String {
        let config = self.config.read();
        match req.download_type {
            Some(DownloadType::Tv) => format!("{}{}", config.tv_save_path, req.save_path),
            Some(DownloadType::Movie) => format!("{}{}", config.movie_save_path, req.save_path),
            None => req.save_path.clone(),
        }
    }

    pub async fn get_download_statuses(&self, hashes: &[String]) -> Result<Vec<DownloadStatus>> {
        self.downloader.get_download_statuses(hashes).await
    }

    pub async fn get_torrent_file_names(&self, hash: &str) -> Result<Vec<String>> {
        self.downloader.get_torrent_file_names(hash).await
    }

    pub async fn continue_download(&self, hash: &str) -> Result<()> {
        self.downloader.continue_download(hash).await
    }

    /// Removes the torrent (and its data) from the client, then the row.
    pub async fn delete_torrent(&self, hash: &str) -> Result<()> {
        self.downloader.delete_torrent(hash).await?;
        self.torrents.delete(hash).await
    }

    async fn check_download_status(self: &Arc<Self>) {
        let statuses = match self.downloader.list_torrents_status().await {
            Ok(statuses) => statuses,
            Err(err) => {
                error!(error = %err, "list torrents from client failed");
                return;
            }
        };
        if statuses.is_empty() {
            return;
        }

        let mut updates = JoinSet::new();
        for status in statuses {
            let manager = self.clone();
            updates.spawn(async move { manager.update_torrent_status(status).await });
        }
        while updates.join_next().await.is_some() {}
    }

    async fn update_torrent_status(&self, status: DownloadStatus) {
        let torrent = match self.torrents.get(&status.hash).await {
            Ok(torrent) => torrent,
            // Not one of ours.
            Err(Error::NotFound(_)) => return,
            Err(err) => {
                error!(hash = %status.hash, error = %err, "load torrent row failed");
                return;
            }
        };

        // Rows past `downloaded` belong to the transfer engine and scraper.
        if !matches!(
            torrent.status,
            TorrentStatus::Downloading
                | TorrentStatus::DownloadError
                | TorrentStatus::Downloaded
                | TorrentStatus::DownloadPaused
        ) {
            return;
        }

        let changed = torrent.status != status.status
            || (status.status == TorrentStatus::DownloadError
                && torrent.status_detail != status.error);
        if !changed {
            return;
        }

        let mut file_names = None;
        if status.status == TorrentStatus::Downloaded {
            match self.downloader.get_torrent_file_names(&torrent.hash).await {
                Ok(names) => file_names = Some(names),
                Err(err) => {
                    error!(hash = %torrent.hash, error = %err, "fetch torrent file names failed");
                    return;
                }
            }
        }

        if let Err(err) = self
            .torrents
            .set_status(
                &torrent.hash,
                status.status,
                &status.error,
                SetTorrentStatusOptions {
                    transfer_type: None,
                    file_names,
                },
            )
            .await
        {
            error!(hash = %torrent.hash, error = %err, "update torrent status failed");
            return;
        }
        info!(hash = %torrent.hash, status = %status.status, "torrent status updated");

        if matches!(
            status.status,
            TorrentStatus::Downloaded | TorrentStatus::DownloadError
        ) {
            if let Err(err) = self
                .notifier
                .notice_downloaded(DownloadedNotice {
                    rss_guid: torrent.rss_guid.clone(),
                    torrent_name: torrent.name.clone(),
                    failed: status.status == TorrentStatus::DownloadError,
                    fail_detail: status.error.clone(),
                    cost: status.cost,
                    size: status.size,
                })
                .await
            {
                warn!(hash = %torrent.hash, error = %err, "downloaded notification failed");
            }
        }
    }

    /// Runs one reconciliation pass immediately; used by tests and the
    /// force-transfer API path.
    pub async fn reconcile_once(self: &Arc<Self>) {
        self.check_download_status().await;
    }
}

impl crate::config::Reloadable for DownloadManager {
    fn reload(&self, config: serde_yaml::Value) -> anyhow::Result<()> {
        let config: DownloadManagerConfig = serde_yaml::from_value(config)?;
        *self.config.write() = config;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted downloader used by manager and pipeline tests.
    #[derive(Default)]
    pub struct StubDownloader {
        pub statuses: Mutex<Vec<DownloadStatus>>,
        pub file_names: Mutex<HashMap<String, Vec<String>>>,
        pub added: Mutex<Vec<(String, String, String)>>,
        pub resumed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Downloader for StubDownloader {
        async fn add_torrent(
            &self,
            torrent_link: &str,
            save_path: &str,
            stop_condition: &str,
        ) -> Result<()> {
            self.added.lock().push((
                torrent_link.to_string(),
                save_path.to_string(),
                stop_condition.to_string(),
            ));
            Ok(())
        }

        async fn set_location(&self, _hash: &str, _save_path: &str) -> Result<()> {
            Ok(())
        }

        async fn get_torrent_name(&self, hash: &str) -> Result<String> {
            Ok(self
                .statuses
                .lock()
                .iter()
                .find(|s| s.hash == hash)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| format!("torrent-{hash}")))
        }

        async fn get_torrent_file_names(&self, hash: &str) -> Result<Vec<String>> {
            Ok(self.file_names.lock().get(hash).cloned().unwrap_or_default())
        }

        async fn continue_download(&self, hash: &str) -> Result<()> {
            self.resumed.lock().push(hash.to_string());
            Ok(())
        }

        async fn delete_torrent(&self, _hash: &str) -> Result<()> {
            Ok(())
        }

        async fn get_download_statuses(&self, hashes: &[String]) -> Result<Vec<DownloadStatus>> {
            Ok(self
                .statuses
                .lock()
                .iter()
                .filter(|s| hashes.is_empty() || hashes.contains(&s.hash))
                .cloned()
                .collect())
        }

        async fn list_torrents_status(&self) -> Result<Vec<DownloadStatus>> {
            Ok(self.statuses.lock().clone())
        }
    }

    pub struct NullNotifier;

    #[async_trait::async_trait]
    impl Notifier for NullNotifier {
        async fn notice_subscription_updated(
            &self,
            _req: crate::notify::SubscriptionUpdatedNotice,
        ) -> Result<()> {
            Ok(())
        }
        async fn notice_downloaded(&self, _req: DownloadedNotice) -> Result<()> {
            Ok(())
        }
        async fn notice_subscription_transferred(
            &self,
            _req: crate::notify::SubscriptionTransferredNotice,
        ) -> Result<()> {
            Ok(())
        }
        async fn notice_task_transferred(
            &self,
            _req: crate::notify::TaskTransferredNotice,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn downloaded_status(hash: &str) -> DownloadStatus {
        DownloadStatus {
            hash: hash.to_string(),
            name: "Foo 01".to_string(),
            progress: 1.0,
            download_speed: 0,
            status: TorrentStatus::Downloaded,
            error: String::new(),
            cost: Duration::from_secs(120),
            size: 700 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn download_adds_unknown_torrent() {
        let pool = crate::db::open_test_db().await;
        let stub = Arc::new(StubDownloader::default());
        let manager = DownloadManager::new(
            stub.clone(),
            TorrentRepository::new(pool.clone()),
            Arc::new(NullNotifier),
            DownloadManagerConfig {
                tv_save_path: "/downloads/tv".to_string(),
                movie_save_path: "/downloads/movies".to_string(),
            },
        );

        let hash = "a".repeat(40);
        manager
            .download(DownloadReq {
                torrent_link: "https://example.com/a.torrent".to_string(),
                hash: hash.clone(),
                save_path: "/Foo/Season 1/".to_string(),
                subscription_id: "sub-1".to_string(),
                download_type: Some(DownloadType::Tv),
                rss_guid: "guid-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let added = stub.added.lock();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].1, "/downloads/tv/Foo/Season 1/");
        assert_eq!(added[0].2, "");

        let stored = TorrentRepository::new(pool).get(&hash).await.unwrap();
        assert_eq!(stored.status, TorrentStatus::Downloading);
        assert_eq!(stored.subscription_id, "sub-1");
    }

    #[tokio::test]
    async fn reconciliation_flips_to_downloaded_with_file_list() {
        let pool = crate::db::open_test_db().await;
        let repo = TorrentRepository::new(pool.clone());
        let stub = Arc::new(StubDownloader::default());
        let manager = DownloadManager::new(
            stub.clone(),
            repo.clone(),
            Arc::new(NullNotifier),
            DownloadManagerConfig::default(),
        );

        let hash = "b".repeat(40);
        manager
            .download(DownloadReq {
                torrent_link: "https://example.com/b.torrent".to_string(),
                hash: hash.clone(),
                subscription_id: "sub-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        stub.statuses.lock().push(downloaded_status(&hash));
        stub.file_names
            .lock()
            .insert(hash.clone(), vec!["Foo 01.mkv".to_string()]);

        manager.reconcile_once().await;

        let stored = repo.get(&hash).await.unwrap();
        assert_eq!(stored.status, TorrentStatus::Downloaded);
        assert_eq!(stored.file_names, vec!["Foo 01.mkv"]);
    }

    #[tokio::test]
    async fn reconciliation_skips_transferred_rows() {
        let pool = crate::db::open_test_db().await;
        let repo = TorrentRepository::new(pool.clone());
        let stub = Arc::new(StubDownloader::default());
        let manager = DownloadManager::new(
            stub.clone(),
            repo.clone(),
            Arc::new(NullNotifier),
            DownloadManagerConfig::default(),
        );

        let hash = "c".repeat(40);
        manager
            .download(DownloadReq {
                torrent_link: "https://example.com/c.torrent".to_string(),
                hash: hash.clone(),
                subscription_id: "sub-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        repo.set_status(
            &hash,
            TorrentStatus::Transferred,
            "",
            SetTorrentStatusOptions::default(),
        )
        .await
        .unwrap();

        // Client still reports it as downloading; the row must not move.
        let mut status = downloaded_status(&hash);
        status.status = TorrentStatus::Downloading;
        stub.statuses.lock().push(status);
        manager.reconcile_once().await;

        assert_eq!(repo.get(&hash).await.unwrap().status, TorrentStatus::Transferred);
    }

    #[tokio::test]
    async fn magnet_request_adds_stopped() {
        let pool = crate::db::open_test_db().await;
        let stub = Arc::new(StubDownloader::default());
        let manager = DownloadManager::new(
            stub.clone(),
            TorrentRepository::new(pool),
            Arc::new(NullNotifier),
            DownloadManagerConfig::default(),
        );

        manager
            .download(DownloadReq {
                torrent_link: "magnet:?xt=urn:btih:".to_string() + &"d".repeat(40),
                hash: "d".repeat(40),
                task_id: "task-1".to_string(),
                not_start: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(stub.added.lock()[0].2, STOP_CONDITION_METADATA);
    }
}
