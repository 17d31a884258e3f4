//! Magnet task workflow: user-driven one-off magnet ingestion.
//!
//! A task moves through three states: waiting-for-parsing (torrent added
//! stopped, no metadata yet), waiting-for-confirmation (file list and show
//! metadata resolved, awaiting user edits) and init-success (confirmed,
//! download running). The torrent row created for the task links back via
//! `task_id`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::db::{MagnetTaskRepository, TorrentRepository};
use crate::downloader::{DownloadManager, DownloadReq, DownloadType, TorrentStatus};
use crate::error::{Error, Result};
use crate::meta::MetaProvider;
use crate::transfer::episode::{parse_anime_title, parse_file_episode, parse_release_group};
use crate::util::{all_extensions, file_base_name, is_media_file, is_subtitle_file};

use std::sync::Arc;

const METADATA_POLL_INTERVAL: Duration = Duration::from_millis(500);
const METADATA_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "waiting for parsing")]
    WaitingForParsing,
    #[serde(rename = "waiting for confirmation")]
    WaitingForConfirmation,
    #[serde(rename = "init success")]
    InitSuccess,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::WaitingForParsing => "waiting for parsing",
            TaskStatus::WaitingForConfirmation => "waiting for confirmation",
            TaskStatus::InitSuccess => "init success",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting for parsing" => Some(TaskStatus::WaitingForParsing),
            "waiting for confirmation" => Some(TaskStatus::WaitingForConfirmation),
            "init success" => Some(TaskStatus::InitSuccess),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentFile {
    pub file_name: String,
    #[serde(default)]
    pub season: i64,
    #[serde(default)]
    pub episode: i64,
    /// True for root-most media files only (deepest-path media are extras).
    #[serde(default)]
    pub media: bool,
    #[serde(default)]
    pub download: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTorrent {
    pub hash: String,
    pub name: String,
    pub files: Vec<TorrentFile>,
    pub size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    pub chinese_name: String,
    pub year: String,
    #[serde(rename = "tmdbID")]
    pub tmdb_id: i64,
    pub release_group: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub magnet_link: String,
    pub torrent: TaskTorrent,
    pub created_at: DateTime<Utc>,
    pub download_type: DownloadType,
    pub meta: TaskMeta,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTaskReq {
    pub magnet_link: String,
    #[serde(rename = "type")]
    pub download_type: DownloadType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskReq {
    #[serde(skip)]
    pub task_id: String,
    #[serde(rename = "tmdbID", default)]
    pub tmdb_id: i64,
    #[serde(default)]
    pub release_group: String,
    pub torrent: TaskTorrent,
    #[serde(default)]
    pub continue_download: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSubtitlesReq {
    #[serde(skip)]
    pub task_id: String,
    pub subtitle_dir: String,
    #[serde(default)]
    pub episode_location: String,
    #[serde(default)]
    pub episode_offset: Option<i64>,
    #[serde(default)]
    pub dst_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksReq {
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub torrent_name: String,
    #[serde(default, skip)]
    pub page: crate::downloader::Page,
}

pub struct MagnetManager {
    manager: Arc<DownloadManager>,
    torrents: TorrentRepository,
    meta: Arc<dyn MetaProvider>,
    repo: MagnetTaskRepository,
}

impl MagnetManager {
    pub fn new(
        manager: Arc<DownloadManager>,
        torrents: TorrentRepository,
        meta: Arc<dyn MetaProvider>,
        repo: MagnetTaskRepository,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            torrents,
            meta,
            repo,
        })
    }

    pub async fn add_task(&self, req: AddTaskReq) -> Result<Task> {
        let hash = extract_hash(&req.magnet_link)?;

        match self.repo.get_by_hash(&hash).await {
            Ok(_) => {
                return Err(Error::conflict(
                    "a magnet task for this torrent already exists",
                ))
            }
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            magnet_link: req.magnet_link.clone(),
            torrent: TaskTorrent {
                hash: hash.clone(),
                ..Default::default()
            },
            created_at: Utc::now(),
            download_type: req.download_type,
            meta: TaskMeta::default(),
            status: TaskStatus::WaitingForParsing,
        };
        self.repo.save(&task).await?;

        let download = self
            .manager
            .download(DownloadReq {
                torrent_link: req.magnet_link,
                hash,
                task_id: task.task_id.clone(),
                download_type: Some(req.download_type),
                not_start: true,
                ..Default::default()
            })
            .await;
        if let Err(err) = download {
            let _ = self.repo.delete(&task.task_id).await;
            return Err(err);
        }

        self.init(task).await
    }

    /// Re-runs metadata resolution, optionally pinning a TMDB id first.
    pub async fn init_task(&self, task_id: &str, tmdb_id: i64) -> Result<Task> {
        let mut task = self.repo.get(task_id).await?;
        if tmdb_id != 0 {
            task.meta.tmdb_id = tmdb_id;
        }
        self.init(task).await
    }

    async fn init(&self, mut task: Task) -> Result<Task> {
        let status = self.wait_for_metadata(&task.torrent.hash).await?;
        info!(hash = %task.torrent.hash, name = %status.name, "magnet metadata resolved");
        task.torrent.name = status.name.clone();
        task.torrent.size = status.size;
        let release_group = parse_release_group(&status.name);

        let file_names = self
            .manager
            .get_torrent_file_names(&task.torrent.hash)
            .await?;
        let media_map = media_file_map(&file_names);

        let mut files = Vec::with_capacity(file_names.len());
        for file_name in file_names {
            let mut file = TorrentFile {
                media: media_map.get(&file_name).copied().unwrap_or(false),
                download: true,
                file_name,
                season: 0,
                episode: 0,
            };
            if file.media && task.download_type == DownloadType::Tv {
                match parse_file_episode(&file.file_name) {
                    Ok((season, episode)) => {
                        file.season = season;
                        file.episode = episode;
                    }
                    Err(err) => {
                        warn!(file = %file.file_name, error = %err, "episode parse failed");
                    }
                }
            }
            files.push(file);
        }
        task.torrent.files = files;
        task.meta.release_group = release_group.clone();

        // Persist what we have before the error-prone metadata lookup.
        self.repo.save(&task).await?;

        let meta = if task.meta.tmdb_id != 0 {
            self.parse_meta_by_id(task.meta.tmdb_id, task.download_type)
                .await?
        } else {
            self.parse_meta_by_torrent(&status.name, task.download_type)
                .await?
        };
        task.meta = TaskMeta {
            chinese_name: meta.chinese_name,
            year: meta.year,
            tmdb_id: meta.tmdb_id,
            release_group,
        };
        task.status = TaskStatus::WaitingForConfirmation;
        self.repo.save(&task).await?;
        Ok(task)
    }

    async fn wait_for_metadata(&self, hash: &str) -> Result<crate::downloader::DownloadStatus> {
        let deadline = tokio::time::Instant::now() + METADATA_POLL_TIMEOUT;
        loop {
            match self
                .manager
                .get_download_statuses(std::slice::from_ref(&hash.to_string()))
                .await
            {
                Ok(statuses) => {
                    if let Some(status) = statuses.into_iter().next() {
                        // Paused means the client received the metadata and
                        // honoured the stop condition.
                        if status.status == TorrentStatus::DownloadPaused {
                            return Ok(status);
                        }
                    }
                }
                Err(err) => {
                    warn!(hash, error = %err, "poll torrent status failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::upstream(format!(
                    "timed out waiting for metadata of magnet {hash}"
                )));
            }
            tokio::time::sleep(METADATA_POLL_INTERVAL).await;
        }
    }

    async fn parse_meta_by_id(
        &self,
        tmdb_id: i64,
        download_type: DownloadType,
    ) -> Result<crate::meta::Meta> {
        match download_type {
            DownloadType::Tv => self.meta.parse_tv(tmdb_id).await,
            DownloadType::Movie => self.meta.parse_movie(tmdb_id).await,
        }
    }

    async fn parse_meta_by_torrent(
        &self,
        torrent_name: &str,
        download_type: DownloadType,
    ) -> Result<crate::meta::Meta> {
        let title = parse_anime_title(torrent_name)
            .ok_or_else(|| Error::bad_request("could not extract a show name from the torrent"))?;
        match download_type {
            DownloadType::Tv => self.meta.search_tv(&title).await,
            DownloadType::Movie => self.meta.search_movie(&title).await,
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.repo.get(task_id).await
    }

    pub async fn list_tasks(&self, req: &ListTasksReq) -> Result<(Vec<Task>, i64)> {
        self.repo.list(req).await
    }

    pub async fn update_task(&self, req: UpdateTaskReq) -> Result<()> {
        let mut task = self.repo.get(&req.task_id).await?;

        if req.tmdb_id != task.meta.tmdb_id {
            let meta = self.parse_meta_by_id(req.tmdb_id, task.download_type).await?;
            task.meta = TaskMeta {
                chinese_name: meta.chinese_name,
                year: meta.year,
                tmdb_id: req.tmdb_id,
                release_group: String::new(),
            };
        }
        task.meta.release_group = req.release_group;
        task.status = TaskStatus::InitSuccess;
        task.torrent = req.torrent;
        self.repo.save(&task).await?;

        if req.continue_download.unwrap_or(false) {
            self.manager.continue_download(&task.torrent.hash).await?;
        }
        Ok(())
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        if task_id.is_empty() {
            return Err(Error::bad_request("task id cannot be empty"));
        }
        self.repo.delete(task_id).await
    }

    /// Copies user-provided subtitles next to the task's media files,
    /// renamed to the media base name plus the subtitle's stacked
    /// extensions. Returns the number of copies made.
    pub async fn add_subtitles(&self, req: AddSubtitlesReq) -> Result<usize> {
        let task = self.repo.get(&req.task_id).await?;
        if task.status != TaskStatus::InitSuccess {
            return Err(Error::bad_request(
                "confirm the task before importing subtitles",
            ));
        }

        let torrent = self.torrents.get(&task.torrent.hash).await?;
        let dst_path = Path::new(&torrent.path).join(req.dst_dir.trim_start_matches('/'));

        let media_files = find_media_files_by_dir(&task, &req.dst_dir)?;
        let subtitle_files = list_subtitle_files(&req.subtitle_dir)?;

        if task.download_type == DownloadType::Movie {
            return copy_movie_subtitles(&subtitle_files, &media_files, &dst_path);
        }
        copy_tv_subtitles(&subtitle_files, &media_files, &req, &dst_path)
    }
}

/// Only media files at the minimum path depth count: fansub extras nested
/// deeper (menus, NCOP/NCED collections) stay unmarked.
fn media_file_map(file_names: &[String]) -> HashMap<String, bool> {
    let mut depths = Vec::new();
    let mut min_depth = usize::MAX;
    for name in file_names {
        if !is_media_file(name) {
            continue;
        }
        let depth = Path::new(name).components().count();
        min_depth = min_depth.min(depth);
        depths.push((name.clone(), depth));
    }
    depths
        .into_iter()
        .map(|(name, depth)| (name, depth == min_depth))
        .collect()
}

fn find_media_files_by_dir(task: &Task, dst_dir: &str) -> Result<Vec<TorrentFile>> {
    let wanted = Path::new(dst_dir.trim_start_matches('/'));
    let media: Vec<TorrentFile> = task
        .torrent
        .files
        .iter()
        .filter(|file| file.media)
        .filter(|file| {
            let dir = Path::new(&file.file_name)
                .parent()
                .unwrap_or_else(|| Path::new(""));
            dir == wanted
        })
        .cloned()
        .collect();
    if media.is_empty() {
        if dst_dir.is_empty() {
            return Err(Error::not_found("no media files in the torrent root"));
        }
        return Err(Error::not_found(format!(
            "no media files in directory {dst_dir}"
        )));
    }
    Ok(media)
}

fn list_subtitle_files(subtitle_dir: &str) -> Result<Vec<PathBuf>> {
    if subtitle_dir.is_empty() {
        return Err(Error::bad_request("subtitle directory is required"));
    }
    let mut subtitles = Vec::new();
    let entries = std::fs::read_dir(subtitle_dir)
        .map_err(|e| Error::bad_request(format!("scan subtitle directory: {e}")))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && is_subtitle_file(&path.to_string_lossy()) {
            subtitles.push(path);
        }
    }
    if subtitles.is_empty() {
        return Err(Error::not_found(format!(
            "no subtitle files in directory {subtitle_dir}"
        )));
    }
    subtitles.sort();
    Ok(subtitles)
}

fn copy_subtitle(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Internal(anyhow::anyhow!("create subtitle directory: {e}")))?;
    }
    std::fs::copy(source, target)
        .map_err(|e| Error::Internal(anyhow::anyhow!("copy subtitle: {e}")))?;
    info!(from = %source.display(), to = %target.display(), "subtitle copied");
    Ok(())
}

fn subtitle_target_name(media_file: &TorrentFile, subtitle: &Path) -> String {
    let media_base = file_base_name(
        Path::new(&media_file.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&media_file.file_name),
    );
    format!("{media_base}{}", all_extensions(&subtitle.to_string_lossy()))
}

fn copy_movie_subtitles(
    subtitles: &[PathBuf],
    media_files: &[TorrentFile],
    dst_path: &Path,
) -> Result<usize> {
    if media_files.len() != 1 {
        return Err(Error::bad_request(format!(
            "a movie task should have exactly one media file, found {}",
            media_files.len()
        )));
    }
    let media = &media_files[0];
    let mut copied = 0;
    for subtitle in subtitles {
        let target = dst_path.join(subtitle_target_name(media, subtitle));
        match copy_subtitle(subtitle, &target) {
            Ok(()) => copied += 1,
            Err(err) => warn!(subtitle = %subtitle.display(), error = %err, "subtitle copy failed"),
        }
    }
    Ok(copied)
}

fn copy_tv_subtitles(
    subtitles: &[PathBuf],
    media_files: &[TorrentFile],
    req: &AddSubtitlesReq,
    dst_path: &Path,
) -> Result<usize> {
    let offset = req.episode_offset.unwrap_or(0);
    let mut by_episode: HashMap<i64, Vec<&PathBuf>> = HashMap::new();
    for subtitle in subtitles {
        let base = subtitle
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let episode = if req.episode_location.is_empty() {
            parse_file_episode(base).map(|(_, episode)| episode)
        } else {
            crate::transfer::episode::parse_episode_with_location(base, &req.episode_location)
        };
        match episode {
            Ok(episode) => by_episode.entry(episode + offset).or_default().push(subtitle),
            Err(err) => {
                warn!(subtitle = %subtitle.display(), error = %err, "subtitle episode parse failed");
            }
        }
    }

    let mut copied = 0;
    for media in media_files {
        let Some(matched) = by_episode.get(&media.episode) else {
            warn!(episode = media.episode, "no subtitle found for episode");
            continue;
        };
        for subtitle in matched {
            let target = dst_path.join(subtitle_target_name(media, subtitle));
            match copy_subtitle(subtitle, &target) {
                Ok(()) => copied += 1,
                Err(err) => {
                    warn!(subtitle = %subtitle.display(), error = %err, "subtitle copy failed");
                }
            }
        }
    }
    Ok(copied)
}

/// Extracts the normalised info-hash from a magnet URI.
pub fn extract_hash(magnet_link: &str) -> Result<String> {
    let url = Url::parse(magnet_link)
        .map_err(|e| Error::bad_request(format!("invalid magnet link: {e}")))?;
    if url.scheme() != "magnet" {
        return Err(Error::bad_request("the link is not a magnet link"));
    }
    let xt = url
        .query_pairs()
        .find(|(key, _)| key == "xt")
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| Error::bad_request("magnet link has no xt parameter"))?;
    info_hash(&xt)
}

/// Normalises an `xt` value to 40 lowercase hex characters. Accepts
/// `urn:btih:` with a 40-char hex or 32-char Base32 payload.
pub fn info_hash(xt: &str) -> Result<String> {
    const PREFIX: &str = "urn:btih:";
    if !xt.to_ascii_lowercase().starts_with(PREFIX) {
        return Err(Error::bad_request("only btih magnet links are supported"));
    }
    let hash = &xt[PREFIX.len()..];
    match hash.len() {
        40 => {
            let hash = hash.to_ascii_lowercase();
            hex::decode(&hash)
                .map_err(|_| Error::bad_request("invalid hex info-hash"))?;
            Ok(hash)
        }
        32 => {
            let decoded = data_encoding::BASE32
                .decode(hash.to_ascii_uppercase().as_bytes())
                .map_err(|_| Error::bad_request("invalid base32 info-hash"))?;
            if decoded.len() != 20 {
                return Err(Error::bad_request("invalid base32 info-hash"));
            }
            Ok(hex::encode(decoded))
        }
        n => Err(Error::bad_request(format!(
            "info-hash length must be 40 (hex) or 32 (base32), got {n}"
        ))),
    }
}
