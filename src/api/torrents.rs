//! Torrent endpoints: recent listing, deletion, forced transfer and the
//! per-torrent file view.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::downloader::{Order, Page, TorrentFilter, TorrentStatus};
use crate::error::{Error, Result};
use crate::subscriber::SubscriptionFilter;
use crate::util::is_media_file;

use super::AppState;

#[derive(Debug, Deserialize)]
struct RecentQuery {
    #[serde(default)]
    page: i64,
    #[serde(default)]
    page_size: i64,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecentTorrent {
    name: String,
    hash: String,
    status: TorrentStatus,
    status_detail: String,
    bangumi_name: String,
    season: i64,
    #[serde(rename = "rssGUID")]
    rss_guid: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecentTorrentsResponse {
    torrents: Vec<RecentTorrent>,
    total: i64,
}

/// GET /torrents/recent — subscription-driven rows, newest first.
async fn list_recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentTorrentsResponse>> {
    let (torrents, total) = state
        .torrents
        .list(&TorrentFilter {
            magnet_task: Some(false),
            start_time: query.start_time,
            end_time: query.end_time,
            page: Page {
                num: query.page,
                size: query.page_size,
            },
            order: Order {
                field: "created_at".to_string(),
                desc: true,
            },
            ..Default::default()
        })
        .await?;

    let subscription_ids: Vec<String> = torrents
        .iter()
        .map(|t| t.subscription_id.clone())
        .filter(|id| !id.is_empty())
        .collect();
    let subscriptions = state
        .subscriber
        .list(&SubscriptionFilter {
            subscription_ids,
            ..Default::default()
        })
        .await?;

    let views = torrents
        .into_iter()
        .map(|torrent| {
            let owner = subscriptions
                .iter()
                .find(|s| s.subscription_id == torrent.subscription_id);
            RecentTorrent {
                name: torrent.name,
                hash: torrent.hash,
                status: torrent.status,
                status_detail: torrent.status_detail,
                bangumi_name: owner.map(|s| s.name.clone()).unwrap_or_default(),
                season: owner.map(|s| s.season).unwrap_or_default(),
                rss_guid: torrent.rss_guid,
                created_at: torrent.created_at,
            }
        })
        .collect();
    Ok(Json(RecentTorrentsResponse {
        torrents: views,
        total,
    }))
}

/// Shared deletion path: transferred library files go first (via transfer
/// records), then optionally the origin data through the client with a
/// manual cleanup fallback.
pub(super) async fn delete_torrent_with_files(
    state: &AppState,
    hash: &str,
    delete_origin_files: bool,
) -> Result<()> {
    let torrent = state.torrents.get(hash).await?;
    for file_name in &torrent.file_names {
        let file_path = std::path::Path::new(&torrent.path).join(file_name);
        let transferred = match state
            .transfer
            .get_transfer_file(&file_path.to_string_lossy())
            .await
        {
            Ok(path) => path,
            Err(Error::NotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        state.transfer.delete_transfer_file(&transferred).await?;
    }

    if delete_origin_files {
        if let Err(err) = state.manager.delete_torrent(hash).await {
            warn!(hash, error = %err, "client-side delete failed, cleaning up manually");
            for file_name in &torrent.file_names {
                let file_path = std::path::Path::new(&torrent.path).join(file_name);
                if let Err(err) = std::fs::remove_file(&file_path) {
                    warn!(file = %file_path.display(), error = %err, "origin file delete failed");
                }
            }
            return state.torrents.delete(hash).await;
        }
        return Ok(());
    }
    state.torrents.delete(hash).await
}

#[derive(Debug, Deserialize)]
struct DeleteTorrentQuery {
    #[serde(default)]
    delete_origin_files: bool,
}

async fn delete_torrent(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<DeleteTorrentQuery>,
) -> Result<StatusCode> {
    delete_torrent_with_files(&state, &hash, query.delete_origin_files).await?;
    Ok(StatusCode::OK)
}

/// POST /torrents/{hash}/transfer — runs the transfer immediately.
async fn transfer_torrent(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<StatusCode> {
    state.transfer.transfer(&hash).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TorrentFileView {
    file_name: String,
    link_name: String,
    episode: i64,
    season: i64,
}

/// GET /torrents/{hash}/files — media files with their library links.
async fn get_torrent_files(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Vec<TorrentFileView>>> {
    let torrent = state.torrents.get(&hash).await?;
    let bangumi = match state.subscriber.get(&torrent.subscription_id).await {
        Ok(bangumi) => Some(bangumi),
        Err(Error::NotFound(_)) | Err(Error::BadRequest(_)) => None,
        Err(err) => return Err(err),
    };

    let mut views = Vec::new();
    for file_name in &torrent.file_names {
        if !is_media_file(file_name) {
            continue;
        }
        let file_path = std::path::Path::new(&torrent.path).join(file_name);
        let episode_location = bangumi
            .as_ref()
            .map(|b| b.episode_location.clone())
            .unwrap_or_default();
        let mut view = TorrentFileView {
            file_name: file_path.to_string_lossy().to_string(),
            link_name: String::new(),
            episode: state
                .transfer
                .parse_episode(file_name, &episode_location)
                .unwrap_or(0),
            season: bangumi.as_ref().map(|b| b.season).unwrap_or_default(),
        };
        match state
            .transfer
            .get_transfer_file(&file_path.to_string_lossy())
            .await
        {
            Ok(link) => view.link_name = link,
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        views.push(view);
    }
    Ok(Json(views))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/torrents/recent", get(list_recent))
        .route("/torrents/{hash}", axum::routing::delete(delete_torrent))
        .route("/torrents/{hash}/transfer", post(transfer_torrent))
        .route("/torrents/{hash}/files", get(get_torrent_files))
}
