//! Structured log tail endpoint.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logging::{query_logs, LogEntry, MAX_LOG_LINES};

use super::AppState;

#[derive(Debug, Deserialize)]
struct LogsQuery {
    level: Option<String>,
    keyword: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /logs — newest first, capped at 200 lines.
async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>> {
    let entries = query_logs(
        std::path::Path::new(&state.env.log_file_path),
        query.level.as_deref(),
        query.keyword.as_deref(),
        query.limit.unwrap_or(50).min(MAX_LOG_LINES),
        query.offset.unwrap_or(0),
    )
    .map_err(Error::Internal)?;
    Ok(Json(entries))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/logs", get(get_logs))
}
