//! Magnet task persistence. The per-file list is stored as JSON, mirroring
//! the task's interactive edit cycle rather than a relational layout.

use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use crate::db::Database;
use crate::downloader::DownloadType;
use crate::error::{Error, Result};
use crate::magnet::{ListTasksReq, Task, TaskMeta, TaskStatus, TaskTorrent, TorrentFile};

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    magnet_link: String,
    torrent_hash: String,
    torrent_name: String,
    torrent_files: String,
    size: i64,
    download_type: String,
    status: String,
    chinese_name: String,
    year: String,
    tmdb_id: i64,
    release_group: String,
    created_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let files: Vec<TorrentFile> = if self.torrent_files.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&self.torrent_files)
                .map_err(|e| Error::Internal(anyhow::anyhow!("decode torrent files: {e}")))?
        };
        Ok(Task {
            task_id: self.task_id,
            magnet_link: self.magnet_link,
            torrent: TaskTorrent {
                hash: self.torrent_hash,
                name: self.torrent_name,
                files,
                size: self.size,
            },
            created_at: self.created_at,
            download_type: DownloadType::parse(&self.download_type).unwrap_or(DownloadType::Tv),
            meta: TaskMeta {
                chinese_name: self.chinese_name,
                year: self.year,
                tmdb_id: self.tmdb_id,
                release_group: self.release_group,
            },
            status: TaskStatus::parse(&self.status).unwrap_or(TaskStatus::WaitingForParsing),
        })
    }
}

#[derive(Clone)]
pub struct MagnetTaskRepository {
    pool: Database,
}

impl MagnetTaskRepository {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    pub async fn save(&self, task: &Task) -> Result<()> {
        let files = serde_json::to_string(&task.torrent.files)
            .map_err(|e| Error::Internal(anyhow::anyhow!("encode torrent files: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO magnet_tasks
                (task_id, magnet_link, torrent_hash, torrent_name, torrent_files, size,
                 download_type, status, chinese_name, year, tmdb_id, release_group,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                magnet_link = excluded.magnet_link,
                torrent_hash = excluded.torrent_hash,
                torrent_name = excluded.torrent_name,
                torrent_files = excluded.torrent_files,
                size = excluded.size,
                download_type = excluded.download_type,
                status = excluded.status,
                chinese_name = excluded.chinese_name,
                year = excluded.year,
                tmdb_id = excluded.tmdb_id,
                release_group = excluded.release_group,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.magnet_link)
        .bind(&task.torrent.hash)
        .bind(&task.torrent.name)
        .bind(files)
        .bind(task.torrent.size)
        .bind(task.download_type.as_str())
        .bind(task.status.as_str())
        .bind(&task.meta.chinese_name)
        .bind(&task.meta.year)
        .bind(task.meta.tmdb_id)
        .bind(&task.meta.release_group)
        .bind(task.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM magnet_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("magnet task {task_id} not found")))?;
        row.into_task()
    }

    pub async fn get_by_hash(&self, hash: &str) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM magnet_tasks WHERE torrent_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("magnet task for hash {hash} not found")))?;
        row.into_task()
    }

    pub async fn list(&self, req: &ListTasksReq) -> Result<(Vec<Task>, i64)> {
        let total: i64 = {
            let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM magnet_tasks WHERE 1 = 1");
            Self::push_filters(&mut qb, req);
            qb.build_query_scalar().fetch_one(&self.pool).await?
        };

        let mut qb = QueryBuilder::new("SELECT * FROM magnet_tasks WHERE 1 = 1");
        Self::push_filters(&mut qb, req);
        qb.push(" ORDER BY created_at DESC, id DESC");
        if !req.page.is_empty() {
            qb.push(" LIMIT ");
            qb.push_bind(req.page.size);
            qb.push(" OFFSET ");
            qb.push_bind((req.page.num - 1).max(0) * req.page.size);
        }
        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>>>()?;
        Ok((tasks, total))
    }

    fn push_filters<'a>(qb: &mut QueryBuilder<'a, sqlx::Sqlite>, req: &'a ListTasksReq) {
        if !req.task_ids.is_empty() {
            qb.push(" AND task_id IN (");
            let mut separated = qb.separated(", ");
            for id in &req.task_ids {
                separated.push_bind(id.as_str());
            }
            qb.push(")");
        }
        if !req.torrent_name.is_empty() {
            qb.push(" AND torrent_name LIKE ");
            qb.push_bind(format!("%{}%", req.torrent_name));
        }
    }

    pub async fn delete(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM magnet_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
