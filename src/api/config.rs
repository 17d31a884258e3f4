//! Per-component config endpoints: GET returns the stored (or default)
//! value, PUT applies it through the hot-reload repository.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::component;
use crate::downloader::adapter::DownloaderConfig;
use crate::downloader::qbittorrent::{check_connection, QbittorrentConfig};
use crate::downloader::DownloadManagerConfig;
use crate::error::{Error, Result};
use crate::meta::TmdbConfig;
use crate::notify::NoticeConfig;
use crate::scraper::ScraperConfig;
use crate::subscriber::SubscriberConfig;
use crate::subtitle::FontSubsetterConfig;
use crate::transfer::TransferConfig;

use super::AppState;

fn read<T>(state: &AppState, key: &str) -> Result<Json<T>>
where
    T: Serialize + DeserializeOwned + Default,
{
    let config = state
        .config_repo
        .component_config::<T>(key)
        .map_err(Error::Internal)?;
    Ok(Json(config))
}

fn write<T>(state: &AppState, key: &str, config: &T) -> Result<StatusCode>
where
    T: Serialize,
{
    state
        .config_repo
        .set_component_config(key, config)
        .map_err(Error::Internal)?;
    Ok(StatusCode::OK)
}

async fn get_tmdb(State(state): State<AppState>) -> Result<Json<TmdbConfig>> {
    read(&state, component::TMDB)
}

async fn set_tmdb(
    State(state): State<AppState>,
    Json(config): Json<TmdbConfig>,
) -> Result<StatusCode> {
    write(&state, component::TMDB, &config)
}

async fn get_download_manager(
    State(state): State<AppState>,
) -> Result<Json<DownloadManagerConfig>> {
    read(&state, component::DOWNLOAD_MANAGER)
}

async fn set_download_manager(
    State(state): State<AppState>,
    Json(config): Json<DownloadManagerConfig>,
) -> Result<StatusCode> {
    write(&state, component::DOWNLOAD_MANAGER, &config)
}

async fn get_downloader(State(state): State<AppState>) -> Result<Json<DownloaderConfig>> {
    read(&state, component::DOWNLOADER)
}

async fn set_downloader(
    State(state): State<AppState>,
    Json(config): Json<DownloaderConfig>,
) -> Result<StatusCode> {
    write(&state, component::DOWNLOADER, &config)
}

async fn get_subscriber(State(state): State<AppState>) -> Result<Json<SubscriberConfig>> {
    read(&state, component::SUBSCRIBER)
}

async fn set_subscriber(
    State(state): State<AppState>,
    Json(config): Json<SubscriberConfig>,
) -> Result<StatusCode> {
    write(&state, component::SUBSCRIBER, &config)
}

async fn get_transfer(State(state): State<AppState>) -> Result<Json<TransferConfig>> {
    read(&state, component::TRANSFER)
}

async fn set_transfer(
    State(state): State<AppState>,
    Json(config): Json<TransferConfig>,
) -> Result<StatusCode> {
    write(&state, component::TRANSFER, &config)
}

async fn get_notice(State(state): State<AppState>) -> Result<Json<NoticeConfig>> {
    read(&state, component::NOTICE)
}

async fn set_notice(
    State(state): State<AppState>,
    Json(config): Json<NoticeConfig>,
) -> Result<StatusCode> {
    write(&state, component::NOTICE, &config)
}

async fn get_subtitle(State(state): State<AppState>) -> Result<Json<FontSubsetterConfig>> {
    read(&state, component::SUBTITLE)
}

async fn set_subtitle(
    State(state): State<AppState>,
    Json(config): Json<FontSubsetterConfig>,
) -> Result<StatusCode> {
    write(&state, component::SUBTITLE, &config)
}

async fn get_scraper(State(state): State<AppState>) -> Result<Json<ScraperConfig>> {
    read(&state, component::SCRAPER)
}

async fn set_scraper(
    State(state): State<AppState>,
    Json(config): Json<ScraperConfig>,
) -> Result<StatusCode> {
    write(&state, component::SCRAPER, &config)
}

/// POST /downloader/qbittorrent/check — probes a candidate configuration.
async fn check_qbittorrent(Json(config): Json<QbittorrentConfig>) -> Result<StatusCode> {
    check_connection(config).await?;
    Ok(StatusCode::OK)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config/tmdb", get(get_tmdb).put(set_tmdb))
        .route(
            "/config/download/manager",
            get(get_download_manager).put(set_download_manager),
        )
        .route(
            "/config/download/downloader",
            get(get_downloader).put(set_downloader),
        )
        .route("/config/subscriber", get(get_subscriber).put(set_subscriber))
        .route("/config/transfer", get(get_transfer).put(set_transfer))
        .route("/config/notice", get(get_notice).put(set_notice))
        .route("/config/subtitle", get(get_subtitle).put(set_subtitle))
        .route("/config/scraper", get(get_scraper).put(set_scraper))
        .route(
            "/downloader/qbittorrent/check",
            axum::routing::post(check_qbittorrent),
        )
}
