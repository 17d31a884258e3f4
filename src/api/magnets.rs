//! Magnet task endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::downloader::Page;
use crate::error::Result;
use crate::magnet::{AddSubtitlesReq, AddTaskReq, ListTasksReq, Task, UpdateTaskReq};

use super::AppState;

async fn add_task(
    State(state): State<AppState>,
    Json(req): Json<AddTaskReq>,
) -> Result<(StatusCode, Json<Task>)> {
    let task = state.magnet.add_task(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    name: String,
    #[serde(default)]
    page: i64,
    #[serde(default)]
    page_size: i64,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    tasks: Vec<Task>,
    total: i64,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>> {
    let (tasks, total) = state
        .magnet
        .list_tasks(&ListTasksReq {
            torrent_name: query.name,
            page: Page {
                num: query.page,
                size: query.page_size,
            },
            ..Default::default()
        })
        .await?;
    Ok(Json(ListResponse { tasks, total }))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>> {
    Ok(Json(state.magnet.get_task(&id).await?))
}

#[derive(Debug, Deserialize)]
struct InitQuery {
    #[serde(default)]
    tmdb_id: i64,
}

/// PUT /magnet/init/{id} — re-runs metadata parsing, optionally pinned to a
/// TMDB id the user picked.
async fn init_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<InitQuery>,
) -> Result<Json<Task>> {
    Ok(Json(state.magnet.init_task(&id, query.tmdb_id).await?))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut req): Json<UpdateTaskReq>,
) -> Result<StatusCode> {
    req.task_id = id;
    state.magnet.update_task(req).await?;
    Ok(StatusCode::OK)
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.torrents.delete_by_task(&id).await?;
    state.magnet.delete_task(&id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct AddSubtitlesResponse {
    transferred: usize,
}

async fn add_subtitles(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut req): Json<AddSubtitlesReq>,
) -> Result<Json<AddSubtitlesResponse>> {
    req.task_id = id;
    let transferred = state.magnet.add_subtitles(req).await?;
    Ok(Json(AddSubtitlesResponse { transferred }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/magnets", get(list_tasks).post(add_task))
        .route(
            "/magnets/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/magnet/init/{id}", put(init_task))
        .route("/magnets/{id}/subtitles", post(add_subtitles))
}
