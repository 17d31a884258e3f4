//! TMDB API client.
//!
//! Base URL: https://api.themoviedb.org/3. Episode lookups walk the
//! zh → zh-SG → zh-HK → zh-TW preference list and merge the first usable
//! value per field; a title of the form `第 n 集` is TMDB's own placeholder
//! and counts as missing.

use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Reloadable;
use crate::error::{Error, Result};

use super::{EpisodeDetails, Meta, MetaProvider};

const BASE_URL: &str = "https://api.themoviedb.org/3";
const IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p/original";
const DETAIL_LANGUAGE: &str = "zh-CN";
const EPISODE_LANGUAGES: &[&str] = &["zh", "zh-SG", "zh-HK", "zh-TW"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TmdbConfig {
    #[serde(default)]
    pub api_key: String,
}

pub struct TmdbClient {
    client: reqwest::Client,
    base_url: String,
    config: RwLock<TmdbConfig>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: i64,
    #[serde(alias = "title")]
    name: Option<String>,
    #[serde(alias = "release_date")]
    first_air_date: Option<String>,
    poster_path: Option<String>,
}

/// Search-result summary for the meta endpoints.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSummary {
    #[serde(rename = "tmdbID")]
    pub tmdb_id: i64,
    pub name: String,
    pub year: String,
    #[serde(rename = "posterURL")]
    pub poster_url: String,
}

#[derive(Debug, Deserialize)]
struct Genre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SeasonSummary {
    season_number: i64,
    episode_count: i64,
}

#[derive(Debug, Deserialize)]
struct EpisodeToAir {
    air_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TvDetails {
    id: i64,
    name: String,
    #[serde(default)]
    overview: String,
    first_air_date: Option<String>,
    poster_path: Option<String>,
    backdrop_path: Option<String>,
    #[serde(default)]
    genres: Vec<Genre>,
    #[serde(default)]
    seasons: Vec<SeasonSummary>,
    next_episode_to_air: Option<EpisodeToAir>,
    last_episode_to_air: Option<EpisodeToAir>,
}

#[derive(Debug, Deserialize)]
struct MovieDetails {
    id: i64,
    title: String,
    #[serde(default)]
    overview: String,
    release_date: Option<String>,
    poster_path: Option<String>,
    backdrop_path: Option<String>,
    #[serde(default)]
    genres: Vec<Genre>,
}

#[derive(Debug, Deserialize)]
struct EpisodeResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    overview: String,
    still_path: Option<String>,
}

fn year_of(date: Option<&str>) -> String {
    date.and_then(|d| d.get(..4)).unwrap_or_default().to_string()
}

fn weekday_of(date: Option<&str>) -> Option<i64> {
    use chrono::Datelike;
    let date = chrono::NaiveDate::parse_from_str(date?, "%Y-%m-%d").ok()?;
    Some(date.weekday().num_days_from_sunday() as i64)
}

fn image_url(path: Option<&str>) -> String {
    path.map(|p| format!("{IMAGE_BASE_URL}{p}")).unwrap_or_default()
}

/// TMDB fills untranslated episode titles with `第 n 集`.
pub fn is_placeholder_title(title: &str) -> bool {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"第\s*\d+\s*集").unwrap());
    re.is_match(title)
}

impl TmdbClient {
    pub fn new(config: TmdbConfig) -> Self {
        Self::with_base_url(config, BASE_URL.to_string())
    }

    pub fn with_base_url(config: TmdbConfig, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("build tmdb http client");
        Self {
            client,
            base_url,
            config: RwLock::new(config),
        }
    }

    fn api_key(&self) -> Result<String> {
        let key = self.config.read().api_key.clone();
        if key.is_empty() {
            return Err(Error::upstream("tmdb api key not configured"));
        }
        Ok(key)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let api_key = self.api_key()?;
        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(&[("api_key", api_key.as_str())]);
        for (k, v) in query {
            request = request.query(&[(*k, *v)]);
        }
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("tmdb resource {path} not found")));
        }
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "tmdb request {path} failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn search_id(&self, kind: &str, name: &str) -> Result<i64> {
        let response: SearchResponse = self
            .get_json(
                &format!("/search/{kind}"),
                &[("query", name), ("language", DETAIL_LANGUAGE)],
            )
            .await?;
        response
            .results
            .first()
            .map(|r| r.id)
            .ok_or_else(|| Error::not_found(format!("no tmdb {kind} match for `{name}`")))
    }

    async fn search_summaries(&self, kind: &str, name: &str) -> Result<Vec<MetaSummary>> {
        let response: SearchResponse = self
            .get_json(
                &format!("/search/{kind}"),
                &[("query", name), ("language", DETAIL_LANGUAGE)],
            )
            .await?;
        Ok(response
            .results
            .into_iter()
            .map(|r| MetaSummary {
                tmdb_id: r.id,
                name: r.name.unwrap_or_default(),
                year: year_of(r.first_air_date.as_deref()),
                poster_url: image_url(r.poster_path.as_deref()),
            })
            .collect())
    }

    /// Candidate list for the TV search endpoint.
    pub async fn search_tvs(&self, name: &str) -> Result<Vec<MetaSummary>> {
        self.search_summaries("tv", name).await
    }

    /// Candidate list for the movie search endpoint.
    pub async fn search_movies(&self, name: &str) -> Result<Vec<MetaSummary>> {
        self.search_summaries("movie", name).await
    }
}

#[async_trait::async_trait]
impl MetaProvider for TmdbClient {
    async fn search_tv(&self, name: &str) -> Result<Meta> {
        let id = self.search_id("tv", name).await?;
        self.parse_tv(id).await
    }

    async fn parse_tv(&self, tmdb_id: i64) -> Result<Meta> {
        let details: TvDetails = self
            .get_json(
                &format!("/tv/{tmdb_id}"),
                &[("language", DETAIL_LANGUAGE)],
            )
            .await?;

        // The newest regular season carries the subscription defaults.
        let last_season = details
            .seasons
            .iter()
            .filter(|s| s.season_number > 0)
            .max_by_key(|s| s.season_number);
        let air_date = details
            .next_episode_to_air
            .as_ref()
            .or(details.last_episode_to_air.as_ref())
            .and_then(|e| e.air_date.as_deref());

        Ok(Meta {
            chinese_name: details.name,
            year: year_of(details.first_air_date.as_deref()),
            tmdb_id: details.id,
            season: last_season.map(|s| s.season_number).unwrap_or(1),
            episode_total_num: last_season.map(|s| s.episode_count).unwrap_or(0),
            air_weekday: weekday_of(air_date),
            poster_url: image_url(details.poster_path.as_deref()),
            backdrop_url: image_url(details.backdrop_path.as_deref()),
            overview: details.overview,
            genres: details
                .genres
                .into_iter()
                .map(|g| g.name)
                .collect::<Vec<_>>()
                .join(","),
        })
    }

    async fn search_movie(&self, name: &str) -> Result<Meta> {
        let id = self.search_id("movie", name).await?;
        self.parse_movie(id).await
    }

    async fn parse_movie(&self, tmdb_id: i64) -> Result<Meta> {
        let details: MovieDetails = self
            .get_json(
                &format!("/movie/{tmdb_id}"),
                &[("language", DETAIL_LANGUAGE)],
            )
            .await?;
        Ok(Meta {
            chinese_name: details.title,
            year: year_of(details.release_date.as_deref()),
            tmdb_id: details.id,
            season: 0,
            episode_total_num: 0,
            air_weekday: None,
            poster_url: image_url(details.poster_path.as_deref()),
            backdrop_url: image_url(details.backdrop_path.as_deref()),
            overview: details.overview,
            genres: details
                .genres
                .into_iter()
                .map(|g| g.name)
                .collect::<Vec<_>>()
                .join(","),
        })
    }

    async fn episode_details(
        &self,
        tmdb_id: i64,
        season: i64,
        episode: i64,
    ) -> Result<EpisodeDetails> {
        let mut merged = EpisodeDetails::default();
        for language in EPISODE_LANGUAGES {
            if !merged.name.is_empty() && !merged.overview.is_empty() && !merged.still_url.is_empty()
            {
                break;
            }
            let response: EpisodeResponse = match self
                .get_json(
                    &format!("/tv/{tmdb_id}/season/{season}/episode/{episode}"),
                    &[("language", language)],
                )
                .await
            {
                Ok(response) => response,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if merged.name.is_empty() && !is_placeholder_title(&response.name) {
                merged.name = response.name;
            }
            if merged.overview.is_empty() {
                merged.overview = response.overview;
            }
            if merged.still_url.is_empty() {
                merged.still_url = image_url(response.still_path.as_deref());
            }
        }
        Ok(merged)
    }
}

impl Reloadable for TmdbClient {
    fn reload(&self, config: serde_yaml::Value) -> anyhow::Result<()> {
        let config: TmdbConfig = serde_yaml::from_value(config)?;
        *self.config.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_titles_are_detected() {
        assert!(is_placeholder_title("第 1 集"));
        assert!(is_placeholder_title("第12集"));
        assert!(!is_placeholder_title("觉醒"));
        assert!(!is_placeholder_title(""));
    }

    #[test]
    fn year_extraction() {
        assert_eq!(year_of(Some("2023-09-29")), "2023");
        assert_eq!(year_of(None), "");
    }

    #[test]
    fn weekday_is_sunday_based() {
        // 2026-01-04 is a Sunday.
        assert_eq!(weekday_of(Some("2026-01-04")), Some(0));
        assert_eq!(weekday_of(Some("2026-01-09")), Some(5));
        assert_eq!(weekday_of(None), None);
    }
}
