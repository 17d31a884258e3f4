//! Show/movie metadata lookup.

pub mod tmdb;

pub use tmdb::{MetaSummary, TmdbClient, TmdbConfig};

use crate::error::Result;

/// Metadata for one show season or movie.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub chinese_name: String,
    pub year: String,
    pub tmdb_id: i64,
    pub season: i64,
    pub episode_total_num: i64,
    /// 0 = Sunday … 6 = Saturday, when the broadcast weekday is known.
    pub air_weekday: Option<i64>,
    pub poster_url: String,
    pub backdrop_url: String,
    pub overview: String,
    pub genres: String,
}

/// Per-episode metadata used by the scraper.
#[derive(Debug, Clone, Default)]
pub struct EpisodeDetails {
    pub name: String,
    pub overview: String,
    pub still_url: String,
}

#[async_trait::async_trait]
pub trait MetaProvider: Send + Sync {
    async fn search_tv(&self, name: &str) -> Result<Meta>;
    async fn parse_tv(&self, tmdb_id: i64) -> Result<Meta>;
    async fn search_movie(&self, name: &str) -> Result<Meta>;
    async fn parse_movie(&self, tmdb_id: i64) -> Result<Meta>;
    async fn episode_details(
        &self,
        tmdb_id: i64,
        season: i64,
        episode: i64,
    ) -> Result<EpisodeDetails>;
}
