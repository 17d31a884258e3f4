//! Scraper: patches NFO sidecars after transfer.
//!
//! The media scanner (Plex/Jellyfin side) writes NFOs with placeholder
//! titles and missing plots for freshly aired episodes. Each pending task
//! is revisited every tick until title, plot and still image are all in
//! order, then dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Reloadable;
use crate::db::scrape_tasks::ScrapeTask;
use crate::db::ScrapeTaskRepository;
use crate::downloader::DownloadType;
use crate::error::{Error, Result};
use crate::meta::tmdb::is_placeholder_title;
use crate::meta::MetaProvider;

fn default_check_interval() -> u64 {
    24
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default)]
    pub enable: bool,
    /// Sweep interval in hours.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            enable: false,
            check_interval: default_check_interval(),
        }
    }
}

/// Key NFO fields, parsed out of `episodedetails`.
#[derive(Debug, Default)]
struct NfoData {
    title: String,
    plot: String,
    poster_path: String,
    season: i64,
    episode: i64,
}

pub struct Scraper {
    repo: ScrapeTaskRepository,
    meta: Arc<dyn MetaProvider>,
    client: reqwest::Client,
    config: RwLock<ScraperConfig>,
    interval: watch::Sender<Duration>,
    stop: watch::Sender<bool>,
}

impl Scraper {
    pub fn new(
        repo: ScrapeTaskRepository,
        meta: Arc<dyn MetaProvider>,
        config: ScraperConfig,
    ) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("build scraper http client");
        let (interval, _) =
            watch::channel(Duration::from_secs(config.check_interval.max(1) * 3600));
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            repo,
            meta,
            client,
            config: RwLock::new(config),
            interval,
            stop,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let scraper = self.clone();
        let mut stop = self.stop.subscribe();
        let mut interval = self.interval.subscribe();
        tokio::spawn(async move {
            loop {
                let period = *interval.borrow();
                tokio::select! {
                    _ = tokio::time::sleep(period) => scraper.check_metadata().await,
                    _ = interval.changed() => continue,
                    _ = stop.changed() => return,
                }
            }
        });
    }

    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    pub fn enabled(&self) -> bool {
        self.config.read().enable
    }

    /// Queues a metadata-fill task for a freshly transferred file. Only TV
    /// files carry per-episode NFOs worth patching.
    pub async fn add_task(
        &self,
        file_path: &str,
        tmdb_id: i64,
        download_type: DownloadType,
    ) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        if download_type != DownloadType::Tv {
            info!(file = file_path, "skipping metadata fill for non-tv file");
            return Ok(());
        }
        self.repo
            .add(&ScrapeTask {
                tmdb_id,
                file_path: file_path.to_string(),
                download_type,
                image_checked: false,
            })
            .await
    }

    pub async fn check_metadata(&self) {
        if !self.enabled() {
            return;
        }
        let tasks = match self.repo.list().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "list metadata tasks failed");
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }
        info!(count = tasks.len(), "checking episode metadata");
        for task in tasks {
            if let Err(err) = self.process_task(&task).await {
                error!(file = %task.file_path, error = %err, "metadata fill failed");
            }
        }
    }

    async fn process_task(&self, task: &ScrapeTask) -> Result<()> {
        if !Path::new(&task.file_path).exists() {
            info!(file = %task.file_path, "media file gone, dropping task");
            let _ = self.repo.delete(&task.file_path).await;
            return Ok(());
        }

        let nfo_path = nfo_path_of(&task.file_path);
        if !nfo_path.exists() {
            // The scanner hasn't produced the NFO yet; next tick.
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&nfo_path)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read nfo: {e}")))?;
        let nfo = parse_nfo(&content)?;
        if nfo.season == 0 || nfo.episode == 0 {
            return Ok(());
        }

        let details = self
            .meta
            .episode_details(task.tmdb_id, nfo.season, nfo.episode)
            .await?;

        let title_invalid = nfo.title.is_empty() || is_placeholder_title(&nfo.title);
        let need_update = title_invalid
            || nfo.plot.is_empty()
            || (!details.still_url.is_empty() && !task.image_checked);
        if !need_update {
            self.repo.delete(&task.file_path).await?;
            return Ok(());
        }

        let new_title = (!details.name.is_empty() && !is_placeholder_title(&details.name))
            .then_some(details.name.as_str());
        let new_plot = (!details.overview.is_empty()).then_some(details.overview.as_str());
        let title_updated = new_title.is_some();
        let plot_updated = new_plot.is_some();
        let mut image_updated = false;

        if title_updated || plot_updated {
            let patched = patch_nfo(&content, new_title, new_plot)?;
            tokio::fs::write(&nfo_path, patched)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("write nfo: {e}")))?;
        }

        if !task.image_checked && !details.still_url.is_empty() && !nfo.poster_path.is_empty() {
            match self
                .check_and_replace_image(&nfo.poster_path, &details.still_url)
                .await
            {
                Ok(()) => {
                    image_updated = true;
                    if let Err(err) = self.repo.update_image_checked(&task.file_path).await {
                        warn!(file = %task.file_path, error = %err, "persist image-checked failed");
                    }
                }
                Err(err) => {
                    warn!(file = %task.file_path, error = %err, "still image update failed");
                    return Err(err);
                }
            }
        }

        if title_updated && plot_updated && (image_updated || task.image_checked) {
            self.repo.delete(&task.file_path).await?;
        }
        Ok(())
    }

    /// Downloads the still, compares MD5 with the current poster file and
    /// overwrites only on mismatch.
    async fn check_and_replace_image(&self, poster_path: &str, still_url: &str) -> Result<()> {
        let response = self.client.get(still_url).send().await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "still download failed with status {}",
                response.status()
            )));
        }
        let new_image = response.bytes().await?;
        let new_digest = md5::compute(&new_image);

        if let Ok(current) = tokio::fs::read(poster_path).await {
            if md5::compute(&current) == new_digest {
                return Ok(());
            }
        }
        tokio::fs::write(poster_path, &new_image)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write poster: {e}")))?;
        info!(poster = poster_path, "episode still replaced");
        Ok(())
    }
}

impl Reloadable for Scraper {
    fn reload(&self, config: serde_yaml::Value) -> anyhow::Result<()> {
        let config: ScraperConfig = serde_yaml::from_value(config)?;
        let _ = self
            .interval
            .send(Duration::from_secs(config.check_interval.max(1) * 3600));
        let disabled = !config.enable;
        *self.config.write() = config;
        if disabled {
            let repo = self.repo.clone();
            tokio::spawn(async move {
                if let Err(err) = repo.clean().await {
                    warn!(error = %err, "clear metadata tasks failed");
                }
            });
        }
        Ok(())
    }
}

fn nfo_path_of(media_path: &str) -> PathBuf {
    let path = Path::new(media_path);
    path.with_extension("nfo")
}

fn parse_nfo(content: &str) -> Result<NfoData> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut data = NfoData::default();
    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader
            .read_event()
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse nfo xml: {e}")))?
        {
            Event::Start(ref e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if path.is_empty() && tag == "episodedetails" {
                    saw_root = true;
                }
                path.push(tag);
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(ref e) => {
                let text = e.unescape().unwrap_or_default().to_string();
                match path
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .as_slice()
                {
                    ["episodedetails", "title"] => data.title = text,
                    ["episodedetails", "plot"] => data.plot = text,
                    ["episodedetails", "season"] => data.season = text.trim().parse().unwrap_or(0),
                    ["episodedetails", "episode"] => {
                        data.episode = text.trim().parse().unwrap_or(0)
                    }
                    ["episodedetails", "art", "poster"] => data.poster_path = text,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(Error::Internal(anyhow::anyhow!(
            "nfo is missing the episodedetails root"
        )));
    }
    Ok(data)
}

/// Rewrites `episodedetails/title` and `episodedetails/plot` text, leaving
/// everything else untouched.
fn patch_nfo(content: &str, new_title: Option<&str>, new_plot: Option<&str>) -> Result<String> {
    let mut reader = Reader::from_str(content);
    let mut writer = Writer::new(std::io::Cursor::new(Vec::new()));
    let mut path: Vec<String> = Vec::new();
    let mut replaced_text = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse nfo xml: {e}")))?;
        match event {
            Event::Start(ref e) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
                replaced_text = false;
                writer
                    .write_event(event.borrow())
                    .map_err(|e| Error::Internal(anyhow::anyhow!("write nfo xml: {e}")))?;
            }
            Event::End(_) => {
                // An empty element gets its replacement injected before the
                // closing tag.
                if !replaced_text {
                    if let Some(text) = replacement_for(&path, new_title, new_plot) {
                        writer
                            .write_event(Event::Text(BytesText::new(text)))
                            .map_err(|e| Error::Internal(anyhow::anyhow!("write nfo xml: {e}")))?;
                    }
                }
                replaced_text = false;
                path.pop();
                writer
                    .write_event(event.borrow())
                    .map_err(|e| Error::Internal(anyhow::anyhow!("write nfo xml: {e}")))?;
            }
            Event::Text(_) => {
                if let Some(text) = replacement_for(&path, new_title, new_plot) {
                    replaced_text = true;
                    writer
                        .write_event(Event::Text(BytesText::new(text)))
                        .map_err(|e| Error::Internal(anyhow::anyhow!("write nfo xml: {e}")))?;
                } else {
                    writer
                        .write_event(event.borrow())
                        .map_err(|e| Error::Internal(anyhow::anyhow!("write nfo xml: {e}")))?;
                }
            }
            Event::Eof => break,
            other => {
                writer
                    .write_event(other.borrow())
                    .map_err(|e| Error::Internal(anyhow::anyhow!("write nfo xml: {e}")))?;
            }
        }
    }

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| Error::Internal(anyhow::anyhow!("encode nfo xml: {e}")))
}

fn replacement_for<'a>(
    path: &[String],
    new_title: Option<&'a str>,
    new_plot: Option<&'a str>,
) -> Option<&'a str> {
    match path.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["episodedetails", "title"] => new_title,
        ["episodedetails", "plot"] => new_plot,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NFO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<episodedetails>
  <title>第 1 集</title>
  <plot></plot>
  <season>1</season>
  <episode>1</episode>
  <art>
    <poster>/tv/Foo/Season 1/Foo S01E01-thumb.jpg</poster>
  </art>
</episodedetails>"#;

    #[test]
    fn parse_extracts_fields() {
        let data = parse_nfo(NFO).unwrap();
        assert_eq!(data.title, "第 1 集");
        assert_eq!(data.plot, "");
        assert_eq!(data.season, 1);
        assert_eq!(data.episode, 1);
        assert!(data.poster_path.ends_with("thumb.jpg"));
    }

    #[test]
    fn parse_rejects_wrong_root() {
        assert!(parse_nfo("<movie><title>x</title></movie>").is_err());
    }

    #[test]
    fn patch_replaces_title_and_fills_empty_plot() {
        let patched = patch_nfo(NFO, Some("觉醒"), Some("第一话的剧情。")).unwrap();
        assert!(patched.contains("<title>觉醒</title>"));
        assert!(patched.contains("<plot>第一话的剧情。</plot>"));
        // Untouched fields survive byte-for-byte.
        assert!(patched.contains("<season>1</season>"));
        assert!(patched.contains("Foo S01E01-thumb.jpg"));
    }

    #[test]
    fn nfo_path_replaces_media_extension() {
        assert_eq!(
            nfo_path_of("/tv/Foo/Season 1/Foo S01E01.mkv"),
            PathBuf::from("/tv/Foo/Season 1/Foo S01E01.nfo")
        );
    }
}
