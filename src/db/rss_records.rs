//! RSS dedupe table: one row per dispatched `(subscription, guid)` pair.
//!
//! Presence means the item has already been handed to the downloader; the
//! polling loop checks this before dispatching and the UI can un-mark rows
//! to force a re-download.

use chrono::Utc;

use crate::db::Database;
use crate::error::Result;

#[derive(Clone)]
pub struct RssRecordRepository {
    pool: Database,
}

impl RssRecordRepository {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    pub async fn is_processed(&self, subscription_id: &str, guid: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rss_records WHERE subscription_id = ? AND guid = ?",
        )
        .bind(subscription_id)
        .bind(guid)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn mark_processed(&self, subscription_id: &str, guids: &[String]) -> Result<()> {
        for guid in guids {
            sqlx::query(
                r#"
                INSERT INTO rss_records (subscription_id, guid, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT(subscription_id, guid) DO NOTHING
                "#,
            )
            .bind(subscription_id)
            .bind(guid)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_processed(&self, subscription_id: &str, guids: &[String]) -> Result<()> {
        for guid in guids {
            sqlx::query("DELETE FROM rss_records WHERE subscription_id = ? AND guid = ?")
                .bind(subscription_id)
                .bind(guid)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn list_processed_guids(&self, subscription_id: &str) -> Result<Vec<String>> {
        let guids: Vec<String> =
            sqlx::query_scalar("SELECT guid FROM rss_records WHERE subscription_id = ?")
                .bind(subscription_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(guids)
    }

    pub async fn delete_by_subscription(&self, subscription_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM rss_records WHERE subscription_id = ?")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_is_idempotent() {
        let pool = crate::db::open_test_db().await;
        let repo = RssRecordRepository::new(pool);
        let guids = vec!["g1".to_string()];
        repo.mark_processed("sub-1", &guids).await.unwrap();
        repo.mark_processed("sub-1", &guids).await.unwrap();

        assert!(repo.is_processed("sub-1", "g1").await.unwrap());
        assert!(!repo.is_processed("sub-2", "g1").await.unwrap());
        assert_eq!(repo.list_processed_guids("sub-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unmark_allows_redispatch() {
        let pool = crate::db::open_test_db().await;
        let repo = RssRecordRepository::new(pool);
        let guids = vec!["g1".to_string()];
        repo.mark_processed("sub-1", &guids).await.unwrap();
        repo.delete_processed("sub-1", &guids).await.unwrap();
        assert!(!repo.is_processed("sub-1", "g1").await.unwrap());
    }
}
