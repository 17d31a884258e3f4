//! Torrent row persistence, keyed by info-hash.
//!
//! The status column is guarded by a conditional upsert: once a row reaches
//! `transferred` or `transferredError`, concurrent reconciliation writes
//! cannot regress it. Only the transfer engine rewrites terminal statuses,
//! through [`TorrentRepository::set_status`].

use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use crate::db::Database;
use crate::downloader::{Torrent, TorrentFilter, TorrentStatus};
use crate::error::{Error, Result};

const FILE_NAMES_SEPARATOR: &str = "|#";

#[derive(Debug, sqlx::FromRow)]
struct TorrentRow {
    hash: String,
    name: String,
    path: String,
    status: String,
    status_detail: String,
    subscription_id: String,
    task_id: String,
    transfer_type: String,
    rss_guid: String,
    file_names: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TorrentRow {
    fn into_torrent(self) -> Torrent {
        let file_names = if self.file_names.is_empty() {
            Vec::new()
        } else {
            self.file_names
                .split(FILE_NAMES_SEPARATOR)
                .map(str::to_string)
                .collect()
        };
        Torrent {
            status: TorrentStatus::parse(&self.status).unwrap_or(TorrentStatus::Downloading),
            hash: self.hash,
            name: self.name,
            path: self.path,
            status_detail: self.status_detail,
            subscription_id: self.subscription_id,
            task_id: self.task_id,
            transfer_type: self.transfer_type,
            rss_guid: self.rss_guid,
            file_names,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Optional columns written together with a status change.
#[derive(Debug, Default)]
pub struct SetTorrentStatusOptions {
    pub transfer_type: Option<String>,
    pub file_names: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct TorrentRepository {
    pool: Database,
}

impl TorrentRepository {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    /// Upsert on `hash`. An existing terminal status is preserved.
    pub async fn save(&self, torrent: &Torrent) -> Result<()> {
        if torrent.hash.is_empty() {
            return Err(Error::bad_request("torrent hash cannot be empty"));
        }
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO torrents
                (hash, name, path, status, status_detail, subscription_id,
                 task_id, transfer_type, rss_guid, file_names, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                name = excluded.name,
                path = excluded.path,
                status = CASE
                    WHEN torrents.status IN ('transferred', 'transferredError')
                    THEN torrents.status
                    ELSE excluded.status
                END,
                status_detail = excluded.status_detail,
                subscription_id = excluded.subscription_id,
                task_id = excluded.task_id,
                transfer_type = excluded.transfer_type,
                rss_guid = excluded.rss_guid,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&torrent.hash)
        .bind(&torrent.name)
        .bind(&torrent.path)
        .bind(torrent.status.as_str())
        .bind(&torrent.status_detail)
        .bind(&torrent.subscription_id)
        .bind(&torrent.task_id)
        .bind(&torrent.transfer_type)
        .bind(&torrent.rss_guid)
        .bind(torrent.file_names.join(FILE_NAMES_SEPARATOR))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Direct status write, used by reconciliation and the transfer engine.
    pub async fn set_status(
        &self,
        hash: &str,
        status: TorrentStatus,
        detail: &str,
        opts: SetTorrentStatusOptions,
    ) -> Result<()> {
        let mut qb = QueryBuilder::new("UPDATE torrents SET status = ");
        qb.push_bind(status.as_str());
        qb.push(", status_detail = ");
        qb.push_bind(detail);
        if let Some(transfer_type) = opts.transfer_type {
            qb.push(", transfer_type = ");
            qb.push_bind(transfer_type);
        }
        if let Some(file_names) = opts.file_names {
            qb.push(", file_names = ");
            qb.push_bind(file_names.join(FILE_NAMES_SEPARATOR));
        }
        qb.push(", updated_at = ");
        qb.push_bind(Utc::now());
        qb.push(" WHERE hash = ");
        qb.push_bind(hash);
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, hash: &str) -> Result<Torrent> {
        if hash.is_empty() {
            return Err(Error::bad_request("torrent hash cannot be empty"));
        }
        let row = sqlx::query_as::<_, TorrentRow>("SELECT * FROM torrents WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("torrent {hash} not found")))?;
        Ok(row.into_torrent())
    }

    /// Filtered listing with stable ordering; returns rows plus total count.
    pub async fn list(&self, filter: &TorrentFilter) -> Result<(Vec<Torrent>, i64)> {
        let total: i64 = {
            let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM torrents WHERE 1 = 1");
            Self::push_filters(&mut qb, filter);
            qb.build_query_scalar().fetch_one(&self.pool).await?
        };

        let mut qb = QueryBuilder::new("SELECT * FROM torrents WHERE 1 = 1");
        Self::push_filters(&mut qb, filter);
        // Ordering fields are whitelisted; anything else falls back to id.
        let order_field = match filter.order.field.as_str() {
            "name" | "created_at" | "updated_at" => filter.order.field.as_str(),
            _ => "id",
        };
        qb.push(format!(
            " ORDER BY {} {}",
            order_field,
            if filter.order.desc { "DESC" } else { "ASC" }
        ));
        if !filter.page.is_empty() {
            qb.push(" LIMIT ");
            qb.push_bind(filter.page.size);
            qb.push(" OFFSET ");
            qb.push_bind((filter.page.num - 1).max(0) * filter.page.size);
        }

        let rows: Vec<TorrentRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok((rows.into_iter().map(TorrentRow::into_torrent).collect(), total))
    }

    fn push_filters<'a>(qb: &mut QueryBuilder<'a, sqlx::Sqlite>, filter: &'a TorrentFilter) {
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            qb.push(")");
        }
        if !filter.subscription_id.is_empty() {
            qb.push(" AND subscription_id = ");
            qb.push_bind(filter.subscription_id.as_str());
        }
        if !filter.task_id.is_empty() {
            qb.push(" AND task_id = ");
            qb.push_bind(filter.task_id.as_str());
        }
        if let Some(magnet_task) = filter.magnet_task {
            if magnet_task {
                qb.push(" AND task_id <> ''");
            } else {
                qb.push(" AND task_id = ''");
            }
        }
        if let Some(start) = filter.start_time {
            qb.push(" AND created_at >= ");
            qb.push_bind(start);
        }
        if let Some(end) = filter.end_time {
            qb.push(" AND created_at <= ");
            qb.push_bind(end);
        }
    }

    pub async fn delete(&self, hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM torrents WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_subscription(&self, subscription_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM torrents WHERE subscription_id = ?")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_task(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM torrents WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hash: &str, status: TorrentStatus) -> Torrent {
        Torrent {
            hash: hash.to_string(),
            name: "Foo S01".to_string(),
            path: "/downloads/tv/Foo/Season 1/".to_string(),
            status,
            status_detail: String::new(),
            subscription_id: "sub-1".to_string(),
            task_id: String::new(),
            transfer_type: String::new(),
            rss_guid: "guid-1".to_string(),
            file_names: vec!["Foo 01.mkv".to_string(), "Foo 01.ass".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_round_trips_file_names() {
        let pool = crate::db::open_test_db().await;
        let repo = TorrentRepository::new(pool);
        let hash = "a".repeat(40);
        repo.save(&sample(&hash, TorrentStatus::Downloading))
            .await
            .unwrap();

        let stored = repo.get(&hash).await.unwrap();
        assert_eq!(stored.status, TorrentStatus::Downloading);
        assert_eq!(stored.file_names, vec!["Foo 01.mkv", "Foo 01.ass"]);
    }

    #[tokio::test]
    async fn upsert_preserves_terminal_status() {
        let pool = crate::db::open_test_db().await;
        let repo = TorrentRepository::new(pool);
        let hash = "b".repeat(40);
        repo.save(&sample(&hash, TorrentStatus::Downloading))
            .await
            .unwrap();
        repo.set_status(
            &hash,
            TorrentStatus::Transferred,
            "",
            SetTorrentStatusOptions::default(),
        )
        .await
        .unwrap();

        // A later reconciliation save must not regress the row.
        repo.save(&sample(&hash, TorrentStatus::Downloaded))
            .await
            .unwrap();
        let stored = repo.get(&hash).await.unwrap();
        assert_eq!(stored.status, TorrentStatus::Transferred);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_owner() {
        let pool = crate::db::open_test_db().await;
        let repo = TorrentRepository::new(pool);
        repo.save(&sample(&"c".repeat(40), TorrentStatus::Downloaded))
            .await
            .unwrap();
        let mut task_row = sample(&"d".repeat(40), TorrentStatus::Downloaded);
        task_row.subscription_id = String::new();
        task_row.task_id = "task-1".to_string();
        repo.save(&task_row).await.unwrap();

        let (rows, total) = repo
            .list(&TorrentFilter {
                statuses: vec![TorrentStatus::Downloaded],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);

        let (rows, _) = repo
            .list(&TorrentFilter {
                magnet_task: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subscription_id, "sub-1");
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let pool = crate::db::open_test_db().await;
        let repo = TorrentRepository::new(pool);
        let err = repo.get(&"e".repeat(40)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
