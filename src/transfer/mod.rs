//! Transfer engine: sweeps completed torrents into the media library.
//!
//! Each tick lists rows in `downloaded`/`transferredError` and processes
//! them sequentially (priority resolution consults the store, so concurrent
//! sweeps would race). A torrent ends the sweep in `transferred` or
//! `transferredError`; the latter is retried on the next tick.

pub mod episode;
pub mod link;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Reloadable;
use crate::db::torrents::SetTorrentStatusOptions;
use crate::db::transfer_records::{
    DeleteTransferRecordReq, GetTransferRecordReq, TransferRecord,
};
use crate::db::{TorrentRepository, TransferRecordRepository};
use crate::downloader::{DownloadType, Torrent, TorrentFilter, TorrentStatus};
use crate::error::{Error, Result};
use crate::magnet::{MagnetManager, Task};
use crate::notify::{Notifier, SubscriptionTransferredNotice, TaskTransferredNotice};
use crate::scraper::Scraper;
use crate::subscriber::Subscriber;
use crate::subtitle::{is_subset_file, Subsetter};
use crate::util::{file_base_name, find_same_base_files, is_media_file, is_font_file};

use link::file_transfer;

fn default_interval() -> u64 {
    1
}

fn default_tv_format() -> String {
    "{name}/Season {season}/{name} {season_episode}".to_string()
}

fn default_movie_format() -> String {
    "{name} ({year})".to_string()
}

fn default_sc_rename_ext() -> String {
    ".zh".to_string()
}

fn default_sc_exts() -> Vec<String> {
    vec![".zh-cn".to_string(), ".zh-hans".to_string(), ".sc".to_string()]
}

fn default_tc_exts() -> Vec<String> {
    vec![
        ".zh-tw".to_string(),
        ".zh-hk".to_string(),
        ".zh-hant".to_string(),
        ".tc".to_string(),
    ]
}

fn default_tc_rename_ext() -> String {
    ".zh-hant".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleRenameConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sc_rename_ext")]
    pub simple_chinese_rename_ext: String,
    #[serde(default = "default_sc_exts")]
    pub simple_chinese_exts: Vec<String>,
    #[serde(default = "default_tc_exts")]
    pub traditional_chinese_exts: Vec<String>,
    #[serde(default = "default_tc_rename_ext")]
    pub traditional_chinese_rename_ext: String,
}

impl Default for SubtitleRenameConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            simple_chinese_rename_ext: default_sc_rename_ext(),
            simple_chinese_exts: default_sc_exts(),
            traditional_chinese_exts: default_tc_exts(),
            traditional_chinese_rename_ext: default_tc_rename_ext(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Sweep interval in minutes.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub tv_path: String,
    #[serde(default = "default_tv_format")]
    pub tv_format: String,
    #[serde(default)]
    pub movie_path: String,
    #[serde(default = "default_movie_format")]
    pub movie_format: String,
    /// `hardlink` or `softlink`.
    #[serde(default)]
    pub transfer_type: String,
    #[serde(default)]
    pub subtitle_rename: SubtitleRenameConfig,
    #[serde(default)]
    pub enable_subtitle_subset: bool,
    #[serde(default)]
    pub ignore_subset_error: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            tv_path: String::new(),
            tv_format: default_tv_format(),
            movie_path: String::new(),
            movie_format: default_movie_format(),
            transfer_type: String::new(),
            subtitle_rename: SubtitleRenameConfig::default(),
            enable_subtitle_subset: false,
            ignore_subset_error: false,
        }
    }
}

/// Everything path templating and related-file handling needs for one file.
#[derive(Debug, Clone)]
struct TransferMeta {
    name: String,
    year: String,
    season: i64,
    file_name: String,
    file_path: PathBuf,
    subscription_id: String,
    release_group: String,
}

/// Accumulates per-file failures; a multi-file torrent reports which file
/// broke, a single-file one keeps the bare message.
struct TransferErrors {
    errors: Vec<String>,
    file_num: usize,
}

impl TransferErrors {
    fn new(file_num: usize) -> Self {
        Self {
            errors: Vec::new(),
            file_num,
        }
    }

    fn push(&mut self, err: &Error, file_name: &str) {
        if self.file_num == 1 {
            self.errors.push(err.to_string());
        } else {
            self.errors
                .push(format!("file {file_name} transfer failed: {err}"));
        }
    }

    fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(anyhow::anyhow!(self.errors.join("; "))))
        }
    }
}

pub struct TransferEngine {
    torrents: TorrentRepository,
    records: TransferRecordRepository,
    subscriber: Arc<Subscriber>,
    magnet: Arc<MagnetManager>,
    scraper: Arc<Scraper>,
    notifier: Arc<dyn Notifier>,
    subsetter: Arc<dyn Subsetter>,
    config: RwLock<TransferConfig>,
    interval: watch::Sender<Duration>,
    stop: watch::Sender<bool>,
}

impl TransferEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        torrents: TorrentRepository,
        records: TransferRecordRepository,
        subscriber: Arc<Subscriber>,
        magnet: Arc<MagnetManager>,
        scraper: Arc<Scraper>,
        notifier: Arc<dyn Notifier>,
        subsetter: Arc<dyn Subsetter>,
        config: TransferConfig,
    ) -> Arc<Self> {
        let (interval, _) = watch::channel(Duration::from_secs(config.interval.max(1) * 60));
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            torrents,
            records,
            subscriber,
            magnet,
            scraper,
            notifier,
            subsetter,
            config: RwLock::new(config),
            interval,
            stop,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let mut stop = self.stop.subscribe();
        let mut interval = self.interval.subscribe();
        tokio::spawn(async move {
            loop {
                let period = *interval.borrow();
                tokio::select! {
                    _ = tokio::time::sleep(period) => engine.sweep().await,
                    _ = interval.changed() => continue,
                    _ = stop.changed() => return,
                }
            }
        });
    }

    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    /// One sweep over all torrents awaiting transfer.
    pub async fn sweep(&self) {
        let (torrents, _) = match self
            .torrents
            .list(&TorrentFilter {
                statuses: vec![TorrentStatus::Downloaded, TorrentStatus::TransferredError],
                ..Default::default()
            })
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "list torrents for transfer failed");
                return;
            }
        };

        for torrent in torrents {
            if let Err(err) = self.transfer_torrent(&torrent).await {
                error!(hash = %torrent.hash, error = %err, "torrent transfer failed");
            }
        }
    }

    /// Force-transfers one torrent (the POST …/transfer endpoint).
    pub async fn transfer(&self, hash: &str) -> Result<()> {
        let torrent = self.torrents.get(hash).await?;
        self.transfer_torrent(&torrent).await
    }

    async fn transfer_torrent(&self, torrent: &Torrent) -> Result<()> {
        let result = if !torrent.subscription_id.is_empty() {
            self.transfer_for_subscription(torrent).await
        } else {
            self.transfer_for_task(torrent).await
        };

        let (status, detail) = match &result {
            Ok(()) => (TorrentStatus::Transferred, String::new()),
            Err(err) => (TorrentStatus::TransferredError, err.to_string()),
        };
        let transfer_type = self.config.read().transfer_type.clone();
        self.torrents
            .set_status(
                &torrent.hash,
                status,
                &detail,
                SetTorrentStatusOptions {
                    transfer_type: Some(transfer_type),
                    file_names: None,
                },
            )
            .await?;
        result
    }

    // ------------------------------------------------------------------
    // Subscription path
    // ------------------------------------------------------------------

    async fn transfer_for_subscription(&self, torrent: &Torrent) -> Result<()> {
        let mut errors = TransferErrors::new(torrent.file_names.len());
        for file_name in &torrent.file_names {
            if !is_media_file(file_name) {
                continue;
            }
            let path = Path::new(&torrent.path).join(file_name);
            if let Err(err) = self
                .transfer_subscription_file(torrent, &path, file_name)
                .await
            {
                error!(file = %file_name, error = %err, "file transfer failed");
                errors.push(&err, file_name);
            }
        }
        errors.into_result()
    }

    async fn transfer_subscription_file(
        &self,
        torrent: &Torrent,
        path: &Path,
        file_name: &str,
    ) -> Result<()> {
        let bangumi = self.subscriber.get(&torrent.subscription_id).await?;

        let result = self
            .transfer_subscription_file_inner(torrent, path, file_name, &bangumi)
            .await;

        // Fresh errors and successes notify; retries of an already-failed
        // row stay quiet.
        let should_notify = match &result {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => torrent.status != TorrentStatus::TransferredError,
        };
        if should_notify {
            let new_file_path = match &result {
                Ok(Some((_, new_file_path))) => new_file_path.clone(),
                _ => String::new(),
            };
            if let Err(err) = self
                .notifier
                .notice_subscription_transferred(SubscriptionTransferredNotice {
                    rss_guid: torrent.rss_guid.clone(),
                    file_name: file_name.to_string(),
                    bangumi_name: bangumi.name.clone(),
                    season: bangumi.season,
                    release_group: bangumi.release_group.clone(),
                    poster: bangumi.poster_url.clone(),
                    media_file_path: new_file_path,
                    error: result.as_ref().err().map(|e| e.to_string()),
                })
                .await
            {
                warn!(error = %err, "transferred notification failed");
            }
        }

        let Some((parsed_episode, new_file_path)) = result? else {
            return Ok(());
        };

        if let Err(err) = self
            .subscriber
            .update_last_air_episode(&torrent.subscription_id, parsed_episode)
            .await
        {
            warn!(error = %err, "update last aired episode failed");
        }

        if self.subscriber.auto_stop_enabled()
            && bangumi.episode_total_num > 0
            && parsed_episode == bangumi.episode_total_num
        {
            info!(
                name = %bangumi.name,
                season = bangumi.season,
                episode = parsed_episode,
                "subscription complete, stopping"
            );
            if let Err(err) = self
                .subscriber
                .stop_subscription(&torrent.subscription_id)
                .await
            {
                warn!(error = %err, "stop subscription failed");
            }
        }

        if self.scraper.enabled() {
            if let Err(err) = self
                .scraper
                .add_task(&new_file_path, bangumi.tmdb_id, DownloadType::Tv)
                .await
            {
                warn!(error = %err, "queue metadata fill failed");
            }
        }
        Ok(())
    }

    /// Returns `Ok(None)` when a higher-priority version already owns the
    /// episode slot.
    async fn transfer_subscription_file_inner(
        &self,
        torrent: &Torrent,
        path: &Path,
        file_name: &str,
        bangumi: &crate::subscriber::Bangumi,
    ) -> Result<Option<(i64, String)>> {
        info!(file = file_name, "transferring file");
        let parsed = if bangumi.episode_location.is_empty() {
            episode::parse_episode(file_name)?
        } else {
            episode::parse_episode_with_location(file_name, &bangumi.episode_location)?
        };
        let episode_number = parsed + bangumi.episode_offset;

        let new_file_id = format!("{}/{}/{}", bangumi.name, bangumi.season, episode_number);
        if !self
            .check_priority(&new_file_id, file_name, bangumi.priority)
            .await?
        {
            return Ok(None);
        }

        let meta = TransferMeta {
            name: bangumi.name.clone(),
            year: bangumi.year.clone(),
            season: bangumi.season,
            file_name: file_name.to_string(),
            file_path: path.to_path_buf(),
            subscription_id: torrent.subscription_id.clone(),
            release_group: bangumi.release_group.clone(),
        };
        let (_, new_file_path) = self
            .transfer_tv_file(&meta, episode_number, &new_file_id, &self.subsetter)
            .await?;
        Ok(Some((episode_number, new_file_path)))
    }

    /// First-writer-wins on equal priority, highest priority wins overall.
    async fn check_priority(
        &self,
        new_file_id: &str,
        file_name: &str,
        priority: i64,
    ) -> Result<bool> {
        let existing = match self
            .records
            .get(&GetTransferRecordReq {
                new_file_id: new_file_id.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(record) => record,
            Err(Error::NotFound(_)) => return Ok(true),
            Err(err) => return Err(err),
        };

        let existing_priority = match self.subscriber.get(&existing.subscription_id).await {
            Ok(owner) => owner.priority,
            Err(Error::NotFound(_)) => {
                // Stale record: its subscription is gone, reclaim the slot.
                let _ = self
                    .records
                    .delete(&DeleteTransferRecordReq {
                        subscription_id: existing.subscription_id.clone(),
                        new_file_id: existing.new_file_id.clone(),
                        ..Default::default()
                    })
                    .await;
                return Ok(true);
            }
            Err(err) => return Err(err),
        };

        if existing_priority > priority {
            info!(
                file = file_name,
                "a higher-priority version exists, skipping transfer"
            );
            return Ok(false);
        }

        info!(
            file = file_name,
            new_priority = priority,
            existing_priority,
            "overwriting the existing lower-priority version"
        );
        if existing.new_file.is_empty() {
            warn!(record = %existing.new_file_id, "record has no file path, nothing to delete");
            return Ok(true);
        }
        match find_same_base_files(Path::new(&existing.new_file)) {
            Ok(files) => {
                for file in files {
                    // Scraper output survives the swap.
                    if file.extension().and_then(|e| e.to_str()) == Some("nfo") {
                        continue;
                    }
                    if let Err(err) = std::fs::remove_file(&file) {
                        warn!(file = %file.display(), error = %err, "delete outranked file failed");
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "locate outranked files failed");
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Magnet-task path
    // ------------------------------------------------------------------

    async fn transfer_for_task(&self, torrent: &Torrent) -> Result<()> {
        let task = self.magnet.get_task(&torrent.task_id).await?;

        let (font_dir, temp_dirs) = self.collect_font_dirs(&task, Path::new(&torrent.path));
        let subsetter = match &font_dir {
            Some(dir) => match self.subsetter.using_temp_font_dir(dir).await {
                Ok(layered) => layered,
                Err(err) => {
                    warn!(error = %err, "temp font overlay failed, using the base catalog");
                    self.subsetter.clone()
                }
            },
            None => self.subsetter.clone(),
        };

        let result = self.transfer_task_files(torrent, &task, &subsetter).await;

        // Extraction directories go away no matter how the transfer went.
        for dir in temp_dirs {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %err, "clean temp font directory failed");
            }
        }

        let (error, success) = match result {
            Ok(success) => (None, success),
            Err((err, success)) => (Some(err), success),
        };
        // Retries of an already-failed row stay quiet; a retry that finally
        // succeeds still announces itself.
        if torrent.status == TorrentStatus::TransferredError {
            if let Some(err) = error {
                return Err(err);
            }
        }

        if let Err(err) = self
            .notifier
            .notice_task_transferred(TaskTransferredNotice {
                bangumi_name: task.meta.chinese_name.clone(),
                torrent_name: torrent.name.clone(),
                media_file_paths: success,
                error: error.as_ref().map(|e| e.to_string()),
            })
            .await
        {
            warn!(error = %err, "task-transferred notification failed");
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn transfer_task_files(
        &self,
        torrent: &Torrent,
        task: &Task,
        subsetter: &Arc<dyn Subsetter>,
    ) -> std::result::Result<HashMap<String, String>, (Error, HashMap<String, String>)> {
        let by_name: HashMap<&str, &crate::magnet::TorrentFile> = task
            .torrent
            .files
            .iter()
            .map(|file| (file.file_name.as_str(), file))
            .collect();

        let mut errors = TransferErrors::new(torrent.file_names.len());
        let mut success = HashMap::new();
        for file_name in &torrent.file_names {
            let Some(file) = by_name.get(file_name.as_str()) else {
                warn!(file = %file_name, "file missing from the task definition");
                continue;
            };
            if !file.download {
                info!(file = %file_name, "not downloaded, skipping");
                continue;
            }
            if !file.media {
                info!(file = %file_name, "not a library file, skipping");
                continue;
            }

            let meta = TransferMeta {
                name: task.meta.chinese_name.clone(),
                year: task.meta.year.clone(),
                season: file.season,
                file_name: file_name.clone(),
                file_path: Path::new(&torrent.path).join(file_name),
                subscription_id: String::new(),
                release_group: task.meta.release_group.clone(),
            };
            let new_file_id = format!("{}-{}", torrent.hash, file_name);
            let result = match task.download_type {
                DownloadType::Tv => {
                    self.transfer_tv_file(&meta, file.episode, &new_file_id, subsetter)
                        .await
                }
                DownloadType::Movie => {
                    self.transfer_movie_file(&meta, &new_file_id, subsetter).await
                }
            };
            match result {
                Ok((origin, new_file)) => {
                    success.insert(origin, new_file);
                }
                Err(err) => {
                    error!(file = %file_name, error = %err, "file transfer failed");
                    errors.push(&err, file_name);
                }
            }
        }

        match errors.into_result() {
            Ok(()) => Ok(success),
            Err(err) => Err((err, success)),
        }
    }

    /// Font files shipped with the task plus extracted `fonts` archives,
    /// reduced to their common parent directory. Returns the extraction
    /// directories so the caller can clean them up.
    fn collect_font_dirs(&self, task: &Task, base_path: &Path) -> (Option<PathBuf>, Vec<PathBuf>) {
        let mut font_dirs = Vec::new();
        let mut temp_dirs = Vec::new();

        for file in &task.torrent.files {
            let file_path = base_path.join(&file.file_name);
            if is_font_file(&file.file_name) {
                if let Some(parent) = file_path.parent() {
                    font_dirs.push(parent.to_path_buf());
                }
                continue;
            }
            if !is_font_archive(&file.file_name) {
                continue;
            }
            if file_path.extension().and_then(|e| e.to_str()) != Some("zip") {
                warn!(file = %file.file_name, "unsupported font archive format, skipped");
                continue;
            }
            let temp_dir = file_path
                .parent()
                .unwrap_or(base_path)
                .join(format!(".fonts_extract_{}", uuid::Uuid::new_v4()));
            if let Err(err) = std::fs::create_dir_all(&temp_dir) {
                warn!(error = %err, "create font extraction directory failed");
                continue;
            }
            if let Err(err) = extract_zip(&file_path, &temp_dir) {
                warn!(file = %file.file_name, error = %err, "extract font archive failed");
                let _ = std::fs::remove_dir_all(&temp_dir);
                continue;
            }
            temp_dirs.push(temp_dir.clone());
            font_dirs.push(temp_dir);
        }

        (common_parent(font_dirs, base_path), temp_dirs)
    }

    // ------------------------------------------------------------------
    // Shared file plumbing
    // ------------------------------------------------------------------

    async fn transfer_tv_file(
        &self,
        meta: &TransferMeta,
        episode_number: i64,
        new_file_id: &str,
        subsetter: &Arc<dyn Subsetter>,
    ) -> Result<(String, String)> {
        let (tv_path, tv_format) = {
            let config = self.config.read();
            (config.tv_path.clone(), config.tv_format.clone())
        };
        let rendered = render_episode_tokens(
            &render_common_tokens(&tv_format, meta),
            meta.season,
            episode_number,
        );
        let without_ext = Path::new(&tv_path).join(rendered);
        self.transfer_file(meta, &without_ext, new_file_id, subsetter)
            .await
    }

    async fn transfer_movie_file(
        &self,
        meta: &TransferMeta,
        new_file_id: &str,
        subsetter: &Arc<dyn Subsetter>,
    ) -> Result<(String, String)> {
        let (movie_path, movie_format) = {
            let config = self.config.read();
            (config.movie_path.clone(), config.movie_format.clone())
        };
        let without_ext = Path::new(&movie_path).join(render_common_tokens(&movie_format, meta));
        self.transfer_file(meta, &without_ext, new_file_id, subsetter)
            .await
    }

    async fn transfer_file(
        &self,
        meta: &TransferMeta,
        new_path_without_ext: &Path,
        new_file_id: &str,
        subsetter: &Arc<dyn Subsetter>,
    ) -> Result<(String, String)> {
        let extension = Path::new(&meta.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let new_file_path = PathBuf::from(format!(
            "{}{extension}",
            new_path_without_ext.to_string_lossy()
        ));

        let transfer_type = self.config.read().transfer_type.clone();
        let origin = file_transfer(&transfer_type).transfer(&meta.file_path, &new_file_path)?;

        self.transfer_related_files(meta, new_path_without_ext, subsetter)
            .await?;

        if let Err(err) = self
            .records
            .set(&TransferRecord {
                origin_file: origin.to_string_lossy().to_string(),
                new_file_id: new_file_id.to_string(),
                new_file: new_file_path.to_string_lossy().to_string(),
                subscription_id: meta.subscription_id.clone(),
                bangumi_name: meta.name.clone(),
                season: meta.season,
            })
            .await
        {
            warn!(error = %err, "save transfer record failed");
        }

        Ok((
            origin.to_string_lossy().to_string(),
            new_file_path.to_string_lossy().to_string(),
        ))
    }

    /// Subtitles and audio sidecars sharing the media file's base name
    /// follow it into the library; subtitles go through the subsetter first.
    async fn transfer_related_files(
        &self,
        meta: &TransferMeta,
        new_path_without_ext: &Path,
        subsetter: &Arc<dyn Subsetter>,
    ) -> Result<()> {
        let files = find_same_base_files(&meta.file_path)
            .map_err(|e| Error::Internal(anyhow::anyhow!("list related files: {e}")))?;
        let (enable_subset, ignore_subset_error, transfer_type, rename) = {
            let config = self.config.read();
            (
                config.enable_subtitle_subset,
                config.ignore_subset_error,
                config.transfer_type.clone(),
                config.subtitle_rename.clone(),
            )
        };

        let mut all_files = Vec::with_capacity(files.len());
        for file in files {
            let name = file.to_string_lossy().to_string();
            if is_subtitle_ext(&name) && enable_subset && !is_subset_file(&name) {
                match subsetter.subset_font(&file).await {
                    Ok(subset) => {
                        if subset != file {
                            all_files.push(subset);
                        }
                    }
                    Err(err) => {
                        if !ignore_subset_error {
                            return Err(Error::Internal(anyhow::anyhow!(
                                "subset subtitle {name}: {err}"
                            )));
                        }
                        warn!(file = %name, error = %err, "subtitle subset failed, using original");
                    }
                }
            }
            all_files.push(file);
        }

        let media_base = file_base_name(&meta.file_path.to_string_lossy());
        for file in all_files {
            if file == meta.file_path {
                continue;
            }
            let name = file.to_string_lossy().to_string();
            let Some(remainder) = name.strip_prefix(&media_base) else {
                continue;
            };

            let is_subtitle = is_subtitle_ext(remainder);
            let is_audio = is_audio_ext(remainder);
            if !is_subtitle && !is_audio {
                continue;
            }

            let target_ext = rename_subtitle_ext(remainder, is_subtitle, &rename);
            let target = PathBuf::from(format!(
                "{}{target_ext}",
                new_path_without_ext.to_string_lossy()
            ));
            info!(from = %name, to = %target.display(), "transferring related file");
            file_transfer(&transfer_type).transfer(&file, &target)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Record-backed lookups used by the API layer
    // ------------------------------------------------------------------

    /// Removes a library file and its sidecars plus the transfer record.
    pub async fn delete_transfer_file(&self, file: &str) -> Result<()> {
        let files = find_same_base_files(Path::new(file))
            .map_err(|e| Error::Internal(anyhow::anyhow!("list related files: {e}")))?;
        for file in files {
            std::fs::remove_file(&file).map_err(|e| {
                Error::Internal(anyhow::anyhow!("delete file {}: {e}", file.display()))
            })?;
        }
        if let Err(err) = self
            .records
            .delete(&DeleteTransferRecordReq {
                new_file: file.to_string(),
                ..Default::default()
            })
            .await
        {
            warn!(error = %err, "delete transfer record failed");
        }
        Ok(())
    }

    pub async fn get_transfer_file(&self, origin_file: &str) -> Result<String> {
        let record = self
            .records
            .get(&GetTransferRecordReq {
                origin_file: origin_file.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(record.new_file)
    }

    pub async fn delete_transfer_cache(&self, req: &DeleteTransferRecordReq) -> Result<()> {
        self.records.delete(req).await
    }

    /// Episode parse helper for torrent views.
    pub fn parse_episode(&self, file_name: &str, episode_location: &str) -> Result<i64> {
        if episode_location.is_empty() {
            episode::parse_episode(file_name)
        } else {
            episode::parse_episode_with_location(file_name, episode_location)
        }
    }
}

impl Reloadable for TransferEngine {
    fn reload(&self, config: serde_yaml::Value) -> anyhow::Result<()> {
        let config: TransferConfig = serde_yaml::from_value(config)?;
        let _ = self
            .interval
            .send(Duration::from_secs(config.interval.max(1) * 60));
        *self.config.write() = config;
        Ok(())
    }
}

/// `{name}`, `{year}`, `{release_group}` and `{origin_name}` are literal
/// substitutions, no escaping.
fn render_common_tokens(format: &str, meta: &TransferMeta) -> String {
    let origin_name = file_base_name(
        Path::new(&meta.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&meta.file_name),
    );
    format
        .replace("{name}", &meta.name)
        .replace("{year}", &meta.year)
        .replace("{release_group}", &meta.release_group)
        .replace("{origin_name}", &origin_name)
}

fn render_episode_tokens(format: &str, season: i64, episode_number: i64) -> String {
    let season_episode = format!(
        "S{}E{}",
        crate::util::format_number(season.max(0) as u32),
        crate::util::format_number(episode_number.max(0) as u32)
    );
    format
        .replace("{episode}", &episode_number.to_string())
        .replace("{season}", &season.to_string())
        .replace("{season_episode}", &season_episode)
}

/// Last extension of a stacked-extension remainder like `.zh.ass`.
fn last_ext(remainder: &str) -> &str {
    match remainder.rfind('.') {
        Some(idx) => &remainder[idx..],
        None => "",
    }
}

fn is_subtitle_ext(remainder: &str) -> bool {
    matches!(
        last_ext(remainder).to_ascii_lowercase().as_str(),
        ".srt" | ".ass" | ".ssa" | ".sub" | ".idx" | ".vtt"
    )
}

fn is_audio_ext(remainder: &str) -> bool {
    matches!(
        remainder.to_ascii_lowercase().as_str(),
        ".aac" | ".ac3" | ".dts" | ".flac" | ".m4a" | ".mka" | ".mp3" | ".ogg"
    )
}

/// Language-code normalisation of subtitle extensions: configured
/// simplified-Chinese tags map to `.zh`, traditional ones to `.zh-hant`.
fn rename_subtitle_ext(ext: &str, is_subtitle: bool, config: &SubtitleRenameConfig) -> String {
    if !is_subtitle || !config.enabled {
        return ext.to_string();
    }
    let lowered = ext.to_lowercase();
    for sc in &config.simple_chinese_exts {
        if lowered.contains(sc) {
            return lowered.replace(sc, &config.simple_chinese_rename_ext);
        }
    }
    for tc in &config.traditional_chinese_exts {
        if lowered.contains(tc) {
            return lowered.replace(tc, &config.traditional_chinese_rename_ext);
        }
    }
    lowered
}

fn is_font_archive(file_name: &str) -> bool {
    let base = file_name
        .rsplit('/')
        .next()
        .unwrap_or(file_name)
        .to_ascii_lowercase();
    if !base.contains("fonts") {
        return false;
    }
    [
        ".zip", ".rar", ".7z", ".tar", ".gz", ".tar.gz", ".bz2", ".tar.bz2", ".xz", ".tar.xz",
    ]
    .iter()
    .any(|ext| base.ends_with(ext))
}

fn extract_zip(archive_path: &Path, target: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(target)?;
    Ok(())
}

/// Common parent of the font directories, clamped to the torrent's base
/// path; directories outside it are ignored.
fn common_parent(mut dirs: Vec<PathBuf>, base_path: &Path) -> Option<PathBuf> {
    dirs.sort();
    dirs.dedup();
    if dirs.is_empty() {
        return None;
    }
    if dirs.len() == 1 {
        return Some(dirs.remove(0));
    }

    let relative: Vec<PathBuf> = dirs
        .iter()
        .filter_map(|dir| dir.strip_prefix(base_path).ok().map(Path::to_path_buf))
        .collect();
    if relative.is_empty() {
        return Some(base_path.to_path_buf());
    }

    let mut common: Vec<std::ffi::OsString> = relative[0]
        .components()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    for path in &relative[1..] {
        let components: Vec<_> = path.components().map(|c| c.as_os_str().to_os_string()).collect();
        let shared = common
            .iter()
            .zip(components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(shared);
    }

    let mut result = base_path.to_path_buf();
    for part in common {
        result.push(part);
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, file_name: &str) -> TransferMeta {
        TransferMeta {
            name: name.to_string(),
            year: "2026".to_string(),
            season: 1,
            file_name: file_name.to_string(),
            file_path: PathBuf::from(format!("/downloads/{file_name}")),
            subscription_id: "sub-1".to_string(),
            release_group: "SweetSub".to_string(),
        }
    }

    #[test]
    fn default_template_renders_plex_layout() {
        let rendered = render_episode_tokens(
            &render_common_tokens(&default_tv_format(), &meta("Foo", "ep01.mkv")),
            1,
            1,
        );
        assert_eq!(rendered, "Foo/Season 1/Foo S01E01");
    }

    #[test]
    fn all_tokens_substitute_literally() {
        let format = "{name}|{year}|{release_group}|{origin_name}|{episode}|{season}|{season_episode}";
        let rendered = render_episode_tokens(
            &render_common_tokens(format, &meta("Foo", "[SweetSub] Foo - 03.mkv")),
            2,
            3,
        );
        assert_eq!(rendered, "Foo|2026|SweetSub|[SweetSub] Foo - 03|3|2|S02E03");
    }

    #[test]
    fn template_output_is_stable() {
        let render = || {
            render_episode_tokens(
                &render_common_tokens(&default_tv_format(), &meta("Foo", "ep12.mkv")),
                1,
                12,
            )
        };
        assert_eq!(render(), render());
        assert_eq!(render(), "Foo/Season 1/Foo S01E12");
    }

    #[test]
    fn subtitle_ext_rename_substitutes_language_tags() {
        let config = SubtitleRenameConfig {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(rename_subtitle_ext(".ZH-CN.ass", true, &config), ".zh.ass");
        assert_eq!(
            rename_subtitle_ext(".zh-tw.ass", true, &config),
            ".zh-hant.ass"
        );
        assert_eq!(rename_subtitle_ext(".en.ass", true, &config), ".en.ass");
        assert_eq!(rename_subtitle_ext(".mka", false, &config), ".mka");

        let disabled = SubtitleRenameConfig::default();
        assert_eq!(rename_subtitle_ext(".ZH-CN.ass", true, &disabled), ".ZH-CN.ass");
    }

    #[test]
    fn related_ext_kind_checks() {
        assert!(is_subtitle_ext(".zh.ass"));
        assert!(is_subtitle_ext(".srt"));
        assert!(!is_subtitle_ext(".mkv"));
        assert!(is_audio_ext(".mka"));
        // Audio sidecars match on the whole remainder only.
        assert!(!is_audio_ext(".zh.mka"));
    }

    #[test]
    fn font_archive_detection() {
        assert!(is_font_archive("Foo/Fonts.zip"));
        assert!(is_font_archive("foo_fonts.7z"));
        assert!(!is_font_archive("Foo/Fonts/readme.txt"));
        assert!(!is_font_archive("Foo.zip"));
    }

    #[test]
    fn common_parent_of_font_dirs() {
        let base = Path::new("/dl/task");
        assert_eq!(
            common_parent(vec![PathBuf::from("/dl/task/a/fonts")], base),
            Some(PathBuf::from("/dl/task/a/fonts"))
        );
        assert_eq!(
            common_parent(
                vec![
                    PathBuf::from("/dl/task/a/fonts"),
                    PathBuf::from("/dl/task/a/extra"),
                ],
                base
            ),
            Some(PathBuf::from("/dl/task/a"))
        );
        assert_eq!(common_parent(vec![], base), None);
    }
}
