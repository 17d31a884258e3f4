//! Font catalog endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::Result;
use crate::subtitle::FontMetaSetStats;

use super::AppState;

/// POST /subtitle/meta-sets — rescans the font library. A concurrent init
/// comes back 409.
async fn init_meta_set(State(state): State<AppState>) -> Result<StatusCode> {
    state.subsetter.init_font_meta_set().await?;
    Ok(StatusCode::OK)
}

async fn meta_set_stats(State(state): State<AppState>) -> Result<Json<FontMetaSetStats>> {
    Ok(Json(state.subsetter.stats().await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/subtitle/meta-sets", post(init_meta_set))
        .route("/subtitle/meta-sets/stats", get(meta_set_stats))
}
