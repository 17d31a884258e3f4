//! Metadata lookup endpoints backed by TMDB.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::Result;
use crate::meta::{Meta, MetaProvider, MetaSummary};

use super::AppState;

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    name: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaView {
    name: String,
    year: String,
    #[serde(rename = "tmdbID")]
    tmdb_id: i64,
    season: i64,
    episode_total_num: i64,
    air_weekday: Option<i64>,
    #[serde(rename = "posterURL")]
    poster_url: String,
    #[serde(rename = "backdropURL")]
    backdrop_url: String,
    overview: String,
    genres: String,
}

impl From<Meta> for MetaView {
    fn from(meta: Meta) -> Self {
        Self {
            name: meta.chinese_name,
            year: meta.year,
            tmdb_id: meta.tmdb_id,
            season: meta.season,
            episode_total_num: meta.episode_total_num,
            air_weekday: meta.air_weekday,
            poster_url: meta.poster_url,
            backdrop_url: meta.backdrop_url,
            overview: meta.overview,
            genres: meta.genres,
        }
    }
}

async fn search_tvs(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<MetaSummary>>> {
    Ok(Json(state.meta.search_tvs(&query.name).await?))
}

async fn search_movies(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<MetaSummary>>> {
    Ok(Json(state.meta.search_movies(&query.name).await?))
}

async fn get_tv(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<MetaView>> {
    Ok(Json(state.meta.parse_tv(id).await?.into()))
}

async fn get_movie(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<MetaView>> {
    Ok(Json(state.meta.parse_movie(id).await?.into()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/meta/tvs", get(search_tvs))
        .route("/meta/movies", get(search_movies))
        .route("/meta/tv/{id}", get(get_tv))
        .route("/meta/movie/{id}", get(get_movie))
}
