//! Transfer records: one `(origin file, new library path)` pair per
//! transferred media file, looked up by either unique key. The priority
//! resolver uses these to detect a previously transferred lower-priority
//! version of the same episode.

use crate::db::Database;
use crate::error::{Error, Result};

/// `new_file_id` is `"{show}/{season}/{episode}"` for subscription transfers
/// and `"{hash}-{file}"` for magnet-task transfers.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct TransferRecord {
    pub origin_file: String,
    pub new_file_id: String,
    pub new_file: String,
    pub subscription_id: String,
    pub bangumi_name: String,
    pub season: i64,
}

/// Lookup request; exactly one key should be set.
#[derive(Debug, Default)]
pub struct GetTransferRecordReq {
    pub origin_file: String,
    pub new_file_id: String,
}

/// Deletion request; any set field narrows the deletion.
#[derive(Debug, Default)]
pub struct DeleteTransferRecordReq {
    pub origin_file: String,
    pub new_file: String,
    pub new_file_id: String,
    pub subscription_id: String,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct TransferRecordRepository {
    pool: Database,
}

impl TransferRecordRepository {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    /// Upsert on `new_file_id`; if the insert instead trips the unique
    /// `origin_file` index, retry keyed on that column.
    pub async fn set(&self, record: &TransferRecord) -> Result<()> {
        let result = self.upsert(record, "new_file_id").await;
        match result {
            Err(err) if is_unique_violation(&err) => {
                self.upsert(record, "origin_file").await.map_err(Into::into)
            }
            other => other.map_err(Into::into),
        }
    }

    async fn upsert(
        &self,
        record: &TransferRecord,
        conflict_column: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO file_transferred
                (origin_file, new_file_id, new_file, subscription_id, bangumi_name, season)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT({conflict_column}) DO UPDATE SET
                origin_file = excluded.origin_file,
                new_file_id = excluded.new_file_id,
                new_file = excluded.new_file,
                subscription_id = excluded.subscription_id,
                bangumi_name = excluded.bangumi_name,
                season = excluded.season
            "#
        );
        sqlx::query(&sql)
            .bind(&record.origin_file)
            .bind(&record.new_file_id)
            .bind(&record.new_file)
            .bind(&record.subscription_id)
            .bind(&record.bangumi_name)
            .bind(record.season)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, req: &GetTransferRecordReq) -> Result<TransferRecord> {
        let record = if !req.new_file_id.is_empty() {
            sqlx::query_as::<_, TransferRecord>(
                "SELECT origin_file, new_file_id, new_file, subscription_id, bangumi_name, season
                 FROM file_transferred WHERE new_file_id = ?",
            )
            .bind(&req.new_file_id)
            .fetch_optional(&self.pool)
            .await?
        } else if !req.origin_file.is_empty() {
            sqlx::query_as::<_, TransferRecord>(
                "SELECT origin_file, new_file_id, new_file, subscription_id, bangumi_name, season
                 FROM file_transferred WHERE origin_file = ?",
            )
            .bind(&req.origin_file)
            .fetch_optional(&self.pool)
            .await?
        } else {
            return Err(Error::bad_request("transfer record lookup needs a key"));
        };
        record.ok_or_else(|| Error::not_found("transfer record not found"))
    }

    pub async fn delete(&self, req: &DeleteTransferRecordReq) -> Result<()> {
        let mut qb = sqlx::QueryBuilder::new("DELETE FROM file_transferred WHERE 1 = 1");
        if !req.origin_file.is_empty() {
            qb.push(" AND origin_file = ");
            qb.push_bind(req.origin_file.as_str());
        }
        if !req.new_file.is_empty() {
            qb.push(" AND new_file = ");
            qb.push_bind(req.new_file.as_str());
        }
        if !req.new_file_id.is_empty() {
            qb.push(" AND new_file_id = ");
            qb.push_bind(req.new_file_id.as_str());
        }
        if !req.subscription_id.is_empty() {
            qb.push(" AND subscription_id = ");
            qb.push_bind(req.subscription_id.as_str());
        }
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(origin: &str, id: &str) -> TransferRecord {
        TransferRecord {
            origin_file: origin.to_string(),
            new_file_id: id.to_string(),
            new_file: "/tv/Foo/Season 1/Foo S01E01.mkv".to_string(),
            subscription_id: "sub-1".to_string(),
            bangumi_name: "Foo".to_string(),
            season: 1,
        }
    }

    #[tokio::test]
    async fn upserts_on_new_file_id() {
        let pool = crate::db::open_test_db().await;
        let repo = TransferRecordRepository::new(pool);
        repo.set(&sample("/dl/a.mkv", "Foo/1/1")).await.unwrap();
        repo.set(&sample("/dl/b.mkv", "Foo/1/1")).await.unwrap();

        let stored = repo
            .get(&GetTransferRecordReq {
                new_file_id: "Foo/1/1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.origin_file, "/dl/b.mkv");
    }

    #[tokio::test]
    async fn falls_back_to_origin_file_key() {
        let pool = crate::db::open_test_db().await;
        let repo = TransferRecordRepository::new(pool);
        repo.set(&sample("/dl/a.mkv", "Foo/1/1")).await.unwrap();
        // Same origin, different episode id: trips the origin_file index.
        repo.set(&sample("/dl/a.mkv", "Foo/1/2")).await.unwrap();

        let stored = repo
            .get(&GetTransferRecordReq {
                origin_file: "/dl/a.mkv".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.new_file_id, "Foo/1/2");
    }

    #[tokio::test]
    async fn delete_by_subscription() {
        let pool = crate::db::open_test_db().await;
        let repo = TransferRecordRepository::new(pool);
        repo.set(&sample("/dl/a.mkv", "Foo/1/1")).await.unwrap();
        repo.delete(&DeleteTransferRecordReq {
            subscription_id: "sub-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let err = repo
            .get(&GetTransferRecordReq {
                new_file_id: "Foo/1/1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
