//! Subscription (bangumi) persistence.
//!
//! `(name, season, release_group)` identifies a unique logical stream;
//! several may coexist for the same show and compete by priority. The
//! RSS link itself is unique across rows.

use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::subscriber::{Bangumi, SubscriptionFilter};

#[derive(Debug, sqlx::FromRow)]
struct BangumiRow {
    subscription_id: String,
    name: String,
    rss_link: String,
    active: bool,
    include_regs: String,
    exclude_regs: String,
    priority: i64,
    episode_offset: i64,
    season: i64,
    year: String,
    tmdb_id: i64,
    release_group: String,
    episode_location: String,
    poster_url: String,
    backdrop_url: String,
    overview: String,
    genres: String,
    air_weekday: i64,
    episode_total_num: i64,
    last_air_episode: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BangumiRow {
    fn into_bangumi(self) -> Bangumi {
        Bangumi {
            subscription_id: self.subscription_id,
            name: self.name,
            rss_link: self.rss_link,
            active: self.active,
            include_regs: decode_regs(&self.include_regs),
            exclude_regs: decode_regs(&self.exclude_regs),
            priority: self.priority,
            episode_offset: self.episode_offset,
            season: self.season,
            year: self.year,
            tmdb_id: self.tmdb_id,
            release_group: self.release_group,
            episode_location: self.episode_location,
            poster_url: self.poster_url,
            backdrop_url: self.backdrop_url,
            overview: self.overview,
            genres: self.genres,
            air_weekday: self.air_weekday,
            episode_total_num: self.episode_total_num,
            last_air_episode: self.last_air_episode,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn decode_regs(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: Database,
}

impl SubscriptionRepository {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    /// Upsert on `subscription_id`; a clash on the unique RSS link surfaces
    /// as a conflict.
    pub async fn save(&self, bangumi: &Bangumi) -> Result<()> {
        let include_regs = serde_json::to_string(&bangumi.include_regs)
            .map_err(|e| Error::Internal(e.into()))?;
        let exclude_regs = serde_json::to_string(&bangumi.exclude_regs)
            .map_err(|e| Error::Internal(e.into()))?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO bangumis
                (subscription_id, name, rss_link, active, include_regs, exclude_regs,
                 priority, episode_offset, season, year, tmdb_id, release_group,
                 episode_location, poster_url, backdrop_url, overview, genres,
                 air_weekday, episode_total_num, last_air_episode, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(subscription_id) DO UPDATE SET
                name = excluded.name,
                rss_link = excluded.rss_link,
                active = excluded.active,
                include_regs = excluded.include_regs,
                exclude_regs = excluded.exclude_regs,
                priority = excluded.priority,
                episode_offset = excluded.episode_offset,
                season = excluded.season,
                year = excluded.year,
                tmdb_id = excluded.tmdb_id,
                release_group = excluded.release_group,
                episode_location = excluded.episode_location,
                poster_url = excluded.poster_url,
                backdrop_url = excluded.backdrop_url,
                overview = excluded.overview,
                genres = excluded.genres,
                air_weekday = excluded.air_weekday,
                episode_total_num = excluded.episode_total_num,
                last_air_episode = excluded.last_air_episode,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&bangumi.subscription_id)
        .bind(&bangumi.name)
        .bind(&bangumi.rss_link)
        .bind(bangumi.active)
        .bind(include_regs)
        .bind(exclude_regs)
        .bind(bangumi.priority)
        .bind(bangumi.episode_offset)
        .bind(bangumi.season)
        .bind(&bangumi.year)
        .bind(bangumi.tmdb_id)
        .bind(&bangumi.release_group)
        .bind(&bangumi.episode_location)
        .bind(&bangumi.poster_url)
        .bind(&bangumi.backdrop_url)
        .bind(&bangumi.overview)
        .bind(&bangumi.genres)
        .bind(bangumi.air_weekday)
        .bind(bangumi.episode_total_num)
        .bind(bangumi.last_air_episode)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(Error::conflict(
                "a subscription with this RSS link already exists",
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, subscription_id: &str) -> Result<Bangumi> {
        if subscription_id.is_empty() {
            return Err(Error::bad_request("subscription id cannot be empty"));
        }
        let row =
            sqlx::query_as::<_, BangumiRow>("SELECT * FROM bangumis WHERE subscription_id = ?")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::not_found(format!("subscription {subscription_id} not found")))?;
        Ok(row.into_bangumi())
    }

    pub async fn list(&self, filter: &SubscriptionFilter) -> Result<Vec<Bangumi>> {
        let mut qb = QueryBuilder::new("SELECT * FROM bangumis WHERE 1 = 1");
        if let Some(active) = filter.active {
            qb.push(" AND active = ");
            qb.push_bind(active);
        }
        if !filter.name.is_empty() {
            qb.push(" AND name = ");
            qb.push_bind(filter.name.as_str());
        }
        if !filter.fuzz_name.is_empty() {
            qb.push(" AND name LIKE ");
            qb.push_bind(format!("%{}%", filter.fuzz_name));
        }
        if filter.season > 0 {
            qb.push(" AND season = ");
            qb.push_bind(filter.season);
        }
        if !filter.subscription_ids.is_empty() {
            qb.push(" AND subscription_id IN (");
            let mut separated = qb.separated(", ");
            for id in &filter.subscription_ids {
                separated.push_bind(id.as_str());
            }
            qb.push(")");
        }
        qb.push(" ORDER BY created_at DESC, id DESC");

        let rows: Vec<BangumiRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(BangumiRow::into_bangumi).collect())
    }

    pub async fn delete(&self, subscription_id: &str) -> Result<()> {
        if subscription_id.is_empty() {
            return Err(Error::bad_request("subscription id cannot be empty"));
        }
        sqlx::query("DELETE FROM bangumis WHERE subscription_id = ?")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Raises `last_air_episode` to the transferred episode, never lowering it.
    pub async fn update_last_air_episode(&self, subscription_id: &str, episode: i64) -> Result<()> {
        sqlx::query(
            "UPDATE bangumis SET last_air_episode = MAX(last_air_episode, ?), updated_at = ? WHERE subscription_id = ?",
        )
        .bind(episode)
        .bind(Utc::now())
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stop(&self, subscription_id: &str) -> Result<()> {
        sqlx::query("UPDATE bangumis SET active = 0, updated_at = ? WHERE subscription_id = ?")
            .bind(Utc::now())
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, link: &str) -> Bangumi {
        Bangumi {
            subscription_id: id.to_string(),
            name: "Foo".to_string(),
            rss_link: link.to_string(),
            active: true,
            include_regs: vec!["1080p".to_string()],
            exclude_regs: vec!["720p".to_string()],
            priority: 5,
            episode_offset: 0,
            season: 1,
            year: "2026".to_string(),
            tmdb_id: 100,
            release_group: "X".to_string(),
            episode_location: String::new(),
            poster_url: String::new(),
            backdrop_url: String::new(),
            overview: String::new(),
            genres: String::new(),
            air_weekday: 3,
            episode_total_num: 12,
            last_air_episode: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let pool = crate::db::open_test_db().await;
        let repo = SubscriptionRepository::new(pool);
        repo.save(&sample("sub-1", "https://example.com/rss/1"))
            .await
            .unwrap();
        let stored = repo.get("sub-1").await.unwrap();
        assert_eq!(stored.include_regs, vec!["1080p"]);
        assert_eq!(stored.exclude_regs, vec!["720p"]);
        assert!(stored.active);
    }

    #[tokio::test]
    async fn duplicate_rss_link_is_conflict() {
        let pool = crate::db::open_test_db().await;
        let repo = SubscriptionRepository::new(pool);
        repo.save(&sample("sub-1", "https://example.com/rss/1"))
            .await
            .unwrap();
        let err = repo
            .save(&sample("sub-2", "https://example.com/rss/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn last_air_episode_never_regresses() {
        let pool = crate::db::open_test_db().await;
        let repo = SubscriptionRepository::new(pool);
        repo.save(&sample("sub-1", "https://example.com/rss/1"))
            .await
            .unwrap();
        repo.update_last_air_episode("sub-1", 5).await.unwrap();
        repo.update_last_air_episode("sub-1", 3).await.unwrap();
        assert_eq!(repo.get("sub-1").await.unwrap().last_air_episode, 5);
    }

    #[tokio::test]
    async fn list_filters() {
        let pool = crate::db::open_test_db().await;
        let repo = SubscriptionRepository::new(pool);
        repo.save(&sample("sub-1", "https://example.com/rss/1"))
            .await
            .unwrap();
        let mut stopped = sample("sub-2", "https://example.com/rss/2");
        stopped.active = false;
        repo.save(&stopped).await.unwrap();

        let active = repo
            .list(&SubscriptionFilter {
                active: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].subscription_id, "sub-1");

        let fuzzy = repo
            .list(&SubscriptionFilter {
                fuzz_name: "oo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fuzzy.len(), 2);
    }
}
