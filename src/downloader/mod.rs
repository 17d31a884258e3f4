//! Downloader abstraction: the stable internal interface the daemon programs
//! against, the qBittorrent implementation behind it, and the torrent
//! lifecycle types shared with the store.

pub mod adapter;
pub mod empty;
pub mod manager;
pub mod qbittorrent;

pub use adapter::{DownloaderAdapter, DownloaderConfig};
pub use manager::{DownloadManager, DownloadManagerConfig};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tag attached to every torrent this daemon manages; listing is scoped to it.
pub const CLIENT_TAG: &str = "bangumid";

/// Torrent lifecycle status.
///
/// `transferred` and `transferredError` are terminal for the reconciliation
/// loop: only the transfer engine may leave them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TorrentStatus {
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "downloadPaused")]
    DownloadPaused,
    #[serde(rename = "downloadError")]
    DownloadError,
    #[serde(rename = "downloaded")]
    Downloaded,
    #[serde(rename = "transferred")]
    Transferred,
    #[serde(rename = "transferredError")]
    TransferredError,
}

impl TorrentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::DownloadPaused => "downloadPaused",
            TorrentStatus::DownloadError => "downloadError",
            TorrentStatus::Downloaded => "downloaded",
            TorrentStatus::Transferred => "transferred",
            TorrentStatus::TransferredError => "transferredError",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "downloading" => TorrentStatus::Downloading,
            "downloadPaused" => TorrentStatus::DownloadPaused,
            "downloadError" => TorrentStatus::DownloadError,
            "downloaded" => TorrentStatus::Downloaded,
            "transferred" => TorrentStatus::Transferred,
            "transferredError" => TorrentStatus::TransferredError,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TorrentStatus::Transferred | TorrentStatus::TransferredError
        )
    }
}

impl std::fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadType {
    #[serde(rename = "tv")]
    Tv,
    #[serde(rename = "movie")]
    Movie,
}

impl DownloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadType::Tv => "tv",
            DownloadType::Movie => "movie",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tv" => Some(DownloadType::Tv),
            "movie" => Some(DownloadType::Movie),
            _ => None,
        }
    }
}

/// The store's canonical record for one piece in the download pipeline.
///
/// Exactly one of `subscription_id` / `task_id` is non-empty for a live row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Torrent {
    pub hash: String,
    pub name: String,
    pub path: String,
    pub status: TorrentStatus,
    pub status_detail: String,
    pub subscription_id: String,
    pub task_id: String,
    pub transfer_type: String,
    pub rss_guid: String,
    pub file_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalised status reported by the external client.
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    pub hash: String,
    pub name: String,
    /// Download progress in `[0, 1]`.
    pub progress: f64,
    /// Bytes per second.
    pub download_speed: i64,
    pub status: TorrentStatus,
    pub error: String,
    /// Wall-clock download cost: completion time minus added time.
    pub cost: Duration,
    pub size: i64,
}

/// Download request handed to the download manager.
#[derive(Debug, Clone, Default)]
pub struct DownloadReq {
    pub torrent_link: String,
    pub hash: String,
    /// Joined after the per-type root save path.
    pub save_path: String,
    pub subscription_id: String,
    pub task_id: String,
    pub tmdb_id: i64,
    pub download_type: Option<DownloadType>,
    pub rss_guid: String,
    /// Add the torrent stopped, waiting for user confirmation (magnet tasks).
    pub not_start: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub num: i64,
    pub size: i64,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.num == 0 && self.size == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Order {
    pub field: String,
    pub desc: bool,
}

impl Order {
    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
    }
}

/// Filter for torrent-row queries.
#[derive(Debug, Clone, Default)]
pub struct TorrentFilter {
    pub statuses: Vec<TorrentStatus>,
    pub subscription_id: String,
    pub task_id: String,
    /// `Some(true)` keeps only magnet-task rows, `Some(false)` excludes them.
    pub magnet_task: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page: Page,
    pub order: Order,
}

/// The external BitTorrent client, behind a stable interface.
///
/// `get_torrent_name` polls at 500 ms intervals for up to 10 s, accepting the
/// first name that differs from the hash: this covers the window where a
/// magnet torrent has been added but no metadata has arrived from peers.
#[async_trait::async_trait]
pub trait Downloader: Send + Sync {
    async fn add_torrent(
        &self,
        torrent_link: &str,
        save_path: &str,
        stop_condition: &str,
    ) -> Result<()>;

    async fn set_location(&self, hash: &str, save_path: &str) -> Result<()>;

    async fn get_torrent_name(&self, hash: &str) -> Result<String>;

    async fn get_torrent_file_names(&self, hash: &str) -> Result<Vec<String>>;

    async fn continue_download(&self, hash: &str) -> Result<()>;

    async fn delete_torrent(&self, hash: &str) -> Result<()>;

    async fn get_download_statuses(&self, hashes: &[String]) -> Result<Vec<DownloadStatus>>;

    /// All torrents tagged with [`CLIENT_TAG`].
    async fn list_torrents_status(&self) -> Result<Vec<DownloadStatus>>;
}
