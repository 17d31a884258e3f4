//! Pending metadata-fill tasks for the scraper loop.

use crate::db::Database;
use crate::downloader::DownloadType;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ScrapeTask {
    pub tmdb_id: i64,
    pub file_path: String,
    pub download_type: DownloadType,
    pub image_checked: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ScrapeTaskRow {
    tmdb_id: i64,
    file_path: String,
    download_type: String,
    image_checked: bool,
}

impl ScrapeTaskRow {
    fn into_task(self) -> ScrapeTask {
        ScrapeTask {
            tmdb_id: self.tmdb_id,
            file_path: self.file_path,
            download_type: DownloadType::parse(&self.download_type).unwrap_or(DownloadType::Tv),
            image_checked: self.image_checked,
        }
    }
}

#[derive(Clone)]
pub struct ScrapeTaskRepository {
    pool: Database,
}

impl ScrapeTaskRepository {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    pub async fn add(&self, task: &ScrapeTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata_checks (tmdb_id, file_path, download_type, image_checked)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                tmdb_id = excluded.tmdb_id,
                download_type = excluded.download_type
            "#,
        )
        .bind(task.tmdb_id)
        .bind(&task.file_path)
        .bind(task.download_type.as_str())
        .bind(task.image_checked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ScrapeTask>> {
        let rows = sqlx::query_as::<_, ScrapeTaskRow>("SELECT * FROM metadata_checks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ScrapeTaskRow::into_task).collect())
    }

    pub async fn delete(&self, file_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM metadata_checks WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_image_checked(&self, file_path: &str) -> Result<()> {
        sqlx::query("UPDATE metadata_checks SET image_checked = 1 WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clean(&self) -> Result<()> {
        sqlx::query("DELETE FROM metadata_checks")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_list_delete_cycle() {
        let pool = crate::db::open_test_db().await;
        let repo = ScrapeTaskRepository::new(pool);
        repo.add(&ScrapeTask {
            tmdb_id: 42,
            file_path: "/tv/Foo/Season 1/Foo S01E01.mkv".to_string(),
            download_type: DownloadType::Tv,
            image_checked: false,
        })
        .await
        .unwrap();

        let tasks = repo.list().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].image_checked);

        repo.update_image_checked("/tv/Foo/Season 1/Foo S01E01.mkv")
            .await
            .unwrap();
        assert!(repo.list().await.unwrap()[0].image_checked);

        repo.delete("/tv/Foo/Season 1/Foo S01E01.mkv").await.unwrap();
        assert!(repo.list().await.unwrap().is_empty());
    }
}
