//! Fallback used when no downloader is configured. Every write operation
//! returns the same sentinel error; listing returns an empty set so the
//! reconciliation loop stays quiet instead of logging every minute.

use crate::error::{Error, Result};

use super::{DownloadStatus, Downloader};

pub const NOT_CONFIGURED: &str =
    "downloader not configured; check the downloader settings and connection";

pub struct EmptyDownloader;

fn not_configured<T>() -> Result<T> {
    Err(Error::upstream(NOT_CONFIGURED))
}

#[async_trait::async_trait]
impl Downloader for EmptyDownloader {
    async fn add_torrent(
        &self,
        _torrent_link: &str,
        _save_path: &str,
        _stop_condition: &str,
    ) -> Result<()> {
        not_configured()
    }

    async fn set_location(&self, _hash: &str, _save_path: &str) -> Result<()> {
        not_configured()
    }

    async fn get_torrent_name(&self, _hash: &str) -> Result<String> {
        not_configured()
    }

    async fn get_torrent_file_names(&self, _hash: &str) -> Result<Vec<String>> {
        not_configured()
    }

    async fn continue_download(&self, _hash: &str) -> Result<()> {
        not_configured()
    }

    async fn delete_torrent(&self, _hash: &str) -> Result<()> {
        not_configured()
    }

    async fn get_download_statuses(&self, _hashes: &[String]) -> Result<Vec<DownloadStatus>> {
        not_configured()
    }

    async fn list_torrents_status(&self) -> Result<Vec<DownloadStatus>> {
        Ok(Vec::new())
    }
}
