//! Embedded state store: a thin typed-query layer over SQLite.
//!
//! Every entity schema is migrated on startup; writes use upsert-on-unique-key
//! semantics owned by the component-specific repositories.

pub mod fonts;
pub mod magnet_tasks;
pub mod rss_records;
pub mod scrape_tasks;
pub mod subscriptions;
pub mod torrents;
pub mod transfer_records;

pub use fonts::FontRepository;
pub use magnet_tasks::MagnetTaskRepository;
pub use rss_records::RssRecordRepository;
pub use scrape_tasks::ScrapeTaskRepository;
pub use subscriptions::SubscriptionRepository;
pub use torrents::TorrentRepository;
pub use transfer_records::TransferRecordRepository;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tokio::time::sleep;

pub type Database = SqlitePool;

/// Ensure the parent directory of the database path exists.
fn ensure_database_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Connect to the database with retries, creating the file and parent
/// directory if they do not exist.
pub async fn connect_with_retry(path: &str, timeout: Duration) -> Result<Database> {
    ensure_database_parent_dir(Path::new(path))?;
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match SqlitePool::connect_with(opts.clone()).await {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                if start.elapsed() >= timeout {
                    anyhow::bail!(
                        "database connection failed after {timeout:?} (attempt {attempt}): {e}"
                    );
                }
                tracing::warn!(attempt, error = %e, "database not ready, retrying in 1s");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Create any missing tables and indexes. Statements are idempotent so the
/// daemon can migrate on every startup.
pub async fn migrate(pool: &Database) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS bangumis (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subscription_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            rss_link TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            include_regs TEXT NOT NULL DEFAULT '[]',
            exclude_regs TEXT NOT NULL DEFAULT '[]',
            priority INTEGER NOT NULL DEFAULT 0,
            episode_offset INTEGER NOT NULL DEFAULT 0,
            season INTEGER NOT NULL DEFAULT 1,
            year TEXT NOT NULL DEFAULT '',
            tmdb_id INTEGER NOT NULL DEFAULT 0,
            release_group TEXT NOT NULL DEFAULT '',
            episode_location TEXT NOT NULL DEFAULT '',
            poster_url TEXT NOT NULL DEFAULT '',
            backdrop_url TEXT NOT NULL DEFAULT '',
            overview TEXT NOT NULL DEFAULT '',
            genres TEXT NOT NULL DEFAULT '',
            air_weekday INTEGER NOT NULL DEFAULT 0,
            episode_total_num INTEGER NOT NULL DEFAULT 0,
            last_air_episode INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_bangumis_name ON bangumis(name)",
        r#"
        CREATE TABLE IF NOT EXISTS rss_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subscription_id TEXT NOT NULL,
            guid TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(subscription_id, guid)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS torrents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL DEFAULT '',
            path TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            status_detail TEXT NOT NULL DEFAULT '',
            subscription_id TEXT NOT NULL DEFAULT '',
            task_id TEXT NOT NULL DEFAULT '',
            transfer_type TEXT NOT NULL DEFAULT '',
            rss_guid TEXT NOT NULL DEFAULT '',
            file_names TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_torrents_subscription ON torrents(subscription_id)",
        "CREATE INDEX IF NOT EXISTS idx_torrents_task ON torrents(task_id)",
        "CREATE INDEX IF NOT EXISTS idx_torrents_created ON torrents(created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS magnet_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL UNIQUE,
            magnet_link TEXT NOT NULL DEFAULT '',
            torrent_hash TEXT NOT NULL DEFAULT '',
            torrent_name TEXT NOT NULL DEFAULT '',
            torrent_files TEXT NOT NULL DEFAULT '[]',
            size INTEGER NOT NULL DEFAULT 0,
            download_type TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            chinese_name TEXT NOT NULL DEFAULT '',
            year TEXT NOT NULL DEFAULT '',
            tmdb_id INTEGER NOT NULL DEFAULT 0,
            release_group TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_magnet_tasks_hash ON magnet_tasks(torrent_hash)",
        r#"
        CREATE TABLE IF NOT EXISTS file_transferred (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            origin_file TEXT NOT NULL UNIQUE,
            new_file_id TEXT NOT NULL UNIQUE,
            new_file TEXT NOT NULL DEFAULT '',
            subscription_id TEXT NOT NULL DEFAULT '',
            bangumi_name TEXT NOT NULL DEFAULT '',
            season INTEGER NOT NULL DEFAULT 0
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_file_transferred_new_file ON file_transferred(new_file)",
        r#"
        CREATE TABLE IF NOT EXISTS metadata_checks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tmdb_id INTEGER NOT NULL,
            file_path TEXT NOT NULL UNIQUE,
            download_type TEXT NOT NULL DEFAULT '',
            image_checked INTEGER NOT NULL DEFAULT 0
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS fonts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            family TEXT NOT NULL DEFAULT '',
            full_name TEXT NOT NULL UNIQUE,
            postscript_name TEXT NOT NULL DEFAULT '',
            family_zh TEXT NOT NULL DEFAULT '',
            full_name_zh TEXT NOT NULL DEFAULT '',
            path TEXT NOT NULL,
            face_index INTEGER NOT NULL DEFAULT 0,
            weight INTEGER NOT NULL DEFAULT 400,
            italic INTEGER NOT NULL DEFAULT 0,
            kind TEXT NOT NULL DEFAULT ''
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("run migration statement")?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) async fn open_test_db() -> Database {
    // A single connection keeps the in-memory database alive and shared.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().in_memory(true))
        .await
        .expect("open in-memory database");
    migrate(&pool).await.expect("migrate test database");
    pool
}
