//! Subscription endpoints, including the grouped library view and the
//! per-subscription torrent view with live download state.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::downloader::{TorrentFilter, TorrentStatus};
use crate::error::Result;
use crate::subscriber::{
    Bangumi, CalendarItem, MarkRssRecordReq, ParseRssRsp, RssMatch, SubscribeReq,
    SubscriptionFilter, UpdateSubscribeReq,
};
use crate::util::is_media_file;

use super::AppState;

#[derive(Debug, Deserialize)]
struct ParseRssQuery {
    #[serde(default)]
    link: String,
}

async fn parse_rss(
    State(state): State<AppState>,
    Query(query): Query<ParseRssQuery>,
) -> Result<Json<ParseRssRsp>> {
    Ok(Json(state.subscriber.parse_rss(&query.link).await?))
}

async fn subscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscribeReq>,
) -> Result<(StatusCode, Json<Bangumi>)> {
    let bangumi = state.subscriber.subscribe(req).await?;
    Ok((StatusCode::CREATED, Json(bangumi)))
}

async fn get_bangumi(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Bangumi>> {
    Ok(Json(state.subscriber.get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    active: Option<bool>,
    #[serde(default)]
    fuzz_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    season: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseGroupSubscription {
    release_group: String,
    episode_total_num: i64,
    last_air_episode: i64,
    #[serde(rename = "subscriptionID")]
    subscription_id: String,
    priority: i64,
    active: bool,
}

/// One show with all its competing release-group subscriptions.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BangumiBase {
    bangumi_name: String,
    season: i64,
    #[serde(rename = "posterURL")]
    poster_url: String,
    #[serde(rename = "backdropURL")]
    backdrop_url: String,
    overview: String,
    genres: String,
    air_weekday: i64,
    release_groups: Vec<ReleaseGroupSubscription>,
    created_at: DateTime<Utc>,
}

async fn list_bangumis(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BangumiBase>>> {
    let bangumis = state
        .subscriber
        .list(&SubscriptionFilter {
            active: query.active,
            fuzz_name: query.fuzz_name,
            name: query.name,
            season: query.season,
            subscription_ids: Vec::new(),
        })
        .await?;

    let mut grouped: BTreeMap<String, BangumiBase> = BTreeMap::new();
    for bangumi in bangumis {
        let entry = grouped
            .entry(bangumi.name.clone())
            .or_insert_with(|| BangumiBase {
                bangumi_name: bangumi.name.clone(),
                season: bangumi.season,
                poster_url: bangumi.poster_url.clone(),
                backdrop_url: bangumi.backdrop_url.clone(),
                overview: bangumi.overview.clone(),
                genres: bangumi.genres.clone(),
                air_weekday: bangumi.air_weekday,
                release_groups: Vec::new(),
                created_at: bangumi.created_at,
            });
        if bangumi.created_at > entry.created_at {
            entry.created_at = bangumi.created_at;
        }
        entry.release_groups.push(ReleaseGroupSubscription {
            release_group: bangumi.release_group,
            episode_total_num: bangumi.episode_total_num,
            last_air_episode: bangumi.last_air_episode,
            subscription_id: bangumi.subscription_id,
            priority: bangumi.priority,
            active: bangumi.active,
        });
    }

    let mut bases: Vec<BangumiBase> = grouped.into_values().collect();
    // Shows with a live subscription first, then newest first.
    bases.sort_by(|a, b| {
        let a_active = a.release_groups.iter().any(|g| g.active);
        let b_active = b.release_groups.iter().any(|g| g.active);
        b_active
            .cmp(&a_active)
            .then(b.created_at.cmp(&a.created_at))
    });
    for base in &mut bases {
        base.release_groups.sort_by(|a, b| {
            b.active
                .cmp(&a.active)
                .then(b.priority.cmp(&a.priority))
                .then(a.release_group.cmp(&b.release_group))
        });
    }
    Ok(Json(bases))
}

async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut req): Json<UpdateSubscribeReq>,
) -> Result<StatusCode> {
    req.subscription_id = id;
    state.subscriber.update_subscription(req).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    delete_files: bool,
}

/// Subscription deletion cascade: torrent rows, transfer records and
/// (optionally) downloaded data all go.
async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode> {
    if query.delete_files {
        let (torrents, _) = state
            .torrents
            .list(&TorrentFilter {
                subscription_id: id.clone(),
                ..Default::default()
            })
            .await?;
        for torrent in torrents {
            super::torrents::delete_torrent_with_files(&state, &torrent.hash, true).await?;
        }
    } else {
        state.torrents.delete_by_subscription(&id).await?;
    }
    state
        .transfer
        .delete_transfer_cache(&crate::db::transfer_records::DeleteTransferRecordReq {
            subscription_id: id.clone(),
            ..Default::default()
        })
        .await?;
    state.subscriber.delete_subscription(&id).await?;
    Ok(StatusCode::OK)
}

async fn get_rss_match(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RssMatch>>> {
    Ok(Json(state.subscriber.get_rss_match(&id).await?))
}

async fn mark_rss_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut req): Json<MarkRssRecordReq>,
) -> Result<StatusCode> {
    req.subscription_id = id;
    state.subscriber.mark_rss_record(req).await?;
    Ok(StatusCode::OK)
}

/// POST …/download — force-runs the subscription's poll cycle now.
async fn run_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.subscriber.handle_bangumi_subscription(&id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BangumiTorrent {
    name: String,
    hash: String,
    status: TorrentStatus,
    status_detail: String,
    #[serde(rename = "rssGUID")]
    rss_guid: String,
    created_at: DateTime<Utc>,
    download_speed: i64,
    progress: f64,
    collection: bool,
    episode: i64,
    season: i64,
}

fn is_collection(torrent_name: &str) -> bool {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\d+-\d+").unwrap());
    !is_media_file(torrent_name) && re.is_match(torrent_name)
}

async fn get_bangumi_torrents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<BangumiTorrent>>> {
    let (torrents, _) = state
        .torrents
        .list(&TorrentFilter {
            subscription_id: id.clone(),
            order: crate::downloader::Order {
                field: "name".to_string(),
                desc: true,
            },
            ..Default::default()
        })
        .await?;
    let bangumi = state.subscriber.get(&id).await?;

    let mut views = Vec::with_capacity(torrents.len());
    for torrent in torrents {
        let mut view = BangumiTorrent {
            name: torrent.name.clone(),
            hash: torrent.hash.clone(),
            status: torrent.status,
            status_detail: torrent.status_detail.clone(),
            rss_guid: torrent.rss_guid.clone(),
            created_at: torrent.created_at,
            download_speed: 0,
            progress: 0.0,
            collection: false,
            episode: 0,
            season: 0,
        };
        // Live rows show the client's current numbers; terminal rows keep
        // what the store recorded.
        if !torrent.status.is_terminal() {
            let statuses = state
                .manager
                .get_download_statuses(std::slice::from_ref(&torrent.hash))
                .await?;
            let Some(live) = statuses.into_iter().next() else {
                continue;
            };
            view.download_speed = live.download_speed;
            view.progress = live.progress;
            view.status = live.status;
            view.status_detail = live.error;
        }

        view.collection = is_collection(&torrent.name);
        if !view.collection {
            view.episode = state
                .transfer
                .parse_episode(&torrent.name, &bangumi.episode_location)
                .unwrap_or(0);
            view.season = bangumi.season;
        }
        views.push(view);
    }
    Ok(Json(views))
}

async fn calendar(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<i64, Vec<CalendarItem>>>> {
    Ok(Json(state.subscriber.get_subscription_calendar().await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bangumis/rss", get(parse_rss))
        .route("/bangumis", get(list_bangumis).post(subscribe))
        .route("/bangumis/calendar", get(calendar))
        .route(
            "/bangumis/{id}",
            get(get_bangumi)
                .put(update_subscription)
                .delete(delete_subscription),
        )
        .route(
            "/bangumis/{id}/rss_match",
            get(get_rss_match).post(mark_rss_record),
        )
        .route("/bangumis/{id}/download", post(run_subscription))
        .route("/bangumis/{id}/torrents", get(get_bangumi_torrents))
}
