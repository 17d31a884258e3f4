//! Integration tests for the acquisition-and-transfer pipeline:
//! status lifecycle, transfer sweeps, priority resolution and idempotence,
//! run against an in-memory store, a scripted downloader and a real
//! temporary filesystem.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use bangumid::db::{
    self, FontRepository, MagnetTaskRepository, RssRecordRepository, ScrapeTaskRepository,
    SubscriptionRepository, TorrentRepository, TransferRecordRepository,
};
use bangumid::db::transfer_records::GetTransferRecordReq;
use bangumid::downloader::{
    DownloadManager, DownloadManagerConfig, DownloadReq, DownloadStatus, DownloadType, Downloader,
    Torrent, TorrentStatus,
};
use bangumid::error::Result;
use bangumid::magnet::{MagnetManager, Task, TaskMeta, TaskStatus, TaskTorrent, TorrentFile};
use bangumid::meta::{EpisodeDetails, Meta, MetaProvider};
use bangumid::notify::{
    DownloadedNotice, Notifier, SubscriptionTransferredNotice, SubscriptionUpdatedNotice,
    TaskTransferredNotice,
};
use bangumid::scraper::{Scraper, ScraperConfig};
use bangumid::subscriber::{Bangumi, Subscriber, SubscriberConfig};
use bangumid::subtitle::{AssSubsetter, FontCatalog, FontSubsetterConfig};
use bangumid::transfer::{TransferConfig, TransferEngine};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
struct ScriptedDownloader {
    statuses: parking_lot::Mutex<Vec<DownloadStatus>>,
}

#[async_trait::async_trait]
impl Downloader for ScriptedDownloader {
    async fn add_torrent(&self, _link: &str, _save_path: &str, _stop: &str) -> Result<()> {
        Ok(())
    }
    async fn set_location(&self, _hash: &str, _save_path: &str) -> Result<()> {
        Ok(())
    }
    async fn get_torrent_name(&self, hash: &str) -> Result<String> {
        Ok(format!("torrent-{hash}"))
    }
    async fn get_torrent_file_names(&self, _hash: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn continue_download(&self, _hash: &str) -> Result<()> {
        Ok(())
    }
    async fn delete_torrent(&self, _hash: &str) -> Result<()> {
        Ok(())
    }
    async fn get_download_statuses(&self, hashes: &[String]) -> Result<Vec<DownloadStatus>> {
        Ok(self
            .statuses
            .lock()
            .iter()
            .filter(|s| hashes.is_empty() || hashes.contains(&s.hash))
            .cloned()
            .collect())
    }
    async fn list_torrents_status(&self) -> Result<Vec<DownloadStatus>> {
        Ok(self.statuses.lock().clone())
    }
}

struct StaticMeta;

#[async_trait::async_trait]
impl MetaProvider for StaticMeta {
    async fn search_tv(&self, _name: &str) -> Result<Meta> {
        self.parse_tv(100).await
    }
    async fn parse_tv(&self, tmdb_id: i64) -> Result<Meta> {
        Ok(Meta {
            chinese_name: "Foo".to_string(),
            year: "2026".to_string(),
            tmdb_id,
            season: 1,
            episode_total_num: 12,
            ..Default::default()
        })
    }
    async fn search_movie(&self, _name: &str) -> Result<Meta> {
        self.parse_movie(200).await
    }
    async fn parse_movie(&self, tmdb_id: i64) -> Result<Meta> {
        Ok(Meta {
            chinese_name: "Foo Movie".to_string(),
            year: "2026".to_string(),
            tmdb_id,
            ..Default::default()
        })
    }
    async fn episode_details(&self, _: i64, _: i64, _: i64) -> Result<EpisodeDetails> {
        Ok(EpisodeDetails::default())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    transferred: parking_lot::Mutex<Vec<SubscriptionTransferredNotice>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notice_subscription_updated(&self, _req: SubscriptionUpdatedNotice) -> Result<()> {
        Ok(())
    }
    async fn notice_downloaded(&self, _req: DownloadedNotice) -> Result<()> {
        Ok(())
    }
    async fn notice_subscription_transferred(
        &self,
        req: SubscriptionTransferredNotice,
    ) -> Result<()> {
        self.transferred.lock().push(req);
        Ok(())
    }
    async fn notice_task_transferred(&self, _req: TaskTransferredNotice) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Pipeline {
    pool: db::Database,
    downloads: tempfile::TempDir,
    library: tempfile::TempDir,
    downloader: Arc<ScriptedDownloader>,
    notifier: Arc<RecordingNotifier>,
    subscriptions: SubscriptionRepository,
    torrents: TorrentRepository,
    records: TransferRecordRepository,
    tasks: MagnetTaskRepository,
    manager: Arc<DownloadManager>,
    engine: Arc<TransferEngine>,
}

async fn pipeline(subscriber_config: SubscriberConfig) -> Pipeline {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(sqlx::sqlite::SqliteConnectOptions::new().in_memory(true))
        .await
        .expect("open database");
    db::migrate(&pool).await.expect("migrate");

    let downloads = tempfile::tempdir().unwrap();
    let library = tempfile::tempdir().unwrap();
    let fonts = tempfile::tempdir().unwrap();

    let downloader = Arc::new(ScriptedDownloader::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let meta: Arc<dyn MetaProvider> = Arc::new(StaticMeta);

    let torrents = TorrentRepository::new(pool.clone());
    let manager = DownloadManager::new(
        downloader.clone(),
        torrents.clone(),
        notifier.clone(),
        DownloadManagerConfig::default(),
    );
    let subscriber = Subscriber::new(
        meta.clone(),
        SubscriptionRepository::new(pool.clone()),
        RssRecordRepository::new(pool.clone()),
        manager.clone(),
        notifier.clone(),
        subscriber_config,
    );
    let magnet = MagnetManager::new(
        manager.clone(),
        torrents.clone(),
        meta.clone(),
        MagnetTaskRepository::new(pool.clone()),
    );
    let catalog = FontCatalog::new(fonts.path(), FontRepository::new(pool.clone()));
    let subsetter = AssSubsetter::new(catalog, FontSubsetterConfig::default());
    let scraper = Scraper::new(
        ScrapeTaskRepository::new(pool.clone()),
        meta,
        ScraperConfig::default(),
    );
    let engine = TransferEngine::new(
        torrents.clone(),
        TransferRecordRepository::new(pool.clone()),
        subscriber.clone(),
        magnet.clone(),
        scraper,
        notifier.clone(),
        subsetter,
        TransferConfig {
            tv_path: library.path().to_string_lossy().to_string(),
            movie_path: library.path().join("movies").to_string_lossy().to_string(),
            transfer_type: "hardlink".to_string(),
            ..Default::default()
        },
    );

    Pipeline {
        subscriptions: SubscriptionRepository::new(pool.clone()),
        records: TransferRecordRepository::new(pool.clone()),
        tasks: MagnetTaskRepository::new(pool.clone()),
        pool,
        downloads,
        library,
        downloader,
        notifier,
        torrents,
        manager,
        engine,
    }
}

fn bangumi(id: &str, priority: i64, group: &str) -> Bangumi {
    Bangumi {
        subscription_id: id.to_string(),
        name: "Foo".to_string(),
        rss_link: format!("https://mikan.example/rss/{id}"),
        active: true,
        priority,
        season: 1,
        year: "2026".to_string(),
        tmdb_id: 100,
        release_group: group.to_string(),
        episode_total_num: 12,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        ..Default::default()
    }
}

fn downloaded_torrent(hash: &str, sub_id: &str, path: &Path, files: &[&str]) -> Torrent {
    Torrent {
        hash: hash.to_string(),
        name: "Foo 01".to_string(),
        path: path.to_string_lossy().to_string(),
        status: TorrentStatus::Downloaded,
        status_detail: String::new(),
        subscription_id: sub_id.to_string(),
        task_id: String::new(),
        transfer_type: String::new(),
        rss_guid: format!("guid-{hash}"),
        file_names: files.iter().map(|f| f.to_string()).collect(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

// ============================================================================
// Download reconciliation
// ============================================================================

#[tokio::test]
async fn reconciliation_only_touches_download_states() {
    let p = pipeline(SubscriberConfig::default()).await;
    let hash = "a".repeat(40);
    p.manager
        .download(DownloadReq {
            torrent_link: "https://example.com/a.torrent".to_string(),
            hash: hash.clone(),
            subscription_id: "sub-1".to_string(),
            download_type: Some(DownloadType::Tv),
            ..Default::default()
        })
        .await
        .unwrap();

    // Client reports completion: the row moves to downloaded.
    p.downloader.statuses.lock().push(DownloadStatus {
        hash: hash.clone(),
        name: "Foo 01".to_string(),
        progress: 1.0,
        download_speed: 0,
        status: TorrentStatus::Downloaded,
        error: String::new(),
        cost: std::time::Duration::from_secs(60),
        size: 1024,
    });
    p.manager.reconcile_once().await;
    assert_eq!(
        p.torrents.get(&hash).await.unwrap().status,
        TorrentStatus::Downloaded
    );

    // Once the transfer engine owns the row, reconciliation is a no-op.
    p.torrents
        .set_status(
            &hash,
            TorrentStatus::Transferred,
            "",
            Default::default(),
        )
        .await
        .unwrap();
    p.downloader.statuses.lock()[0].status = TorrentStatus::Downloading;
    p.manager.reconcile_once().await;
    assert_eq!(
        p.torrents.get(&hash).await.unwrap().status,
        TorrentStatus::Transferred
    );
}

// ============================================================================
// Subscription transfer path
// ============================================================================

#[tokio::test]
async fn happy_path_transfer_links_media_and_sidecars() {
    let p = pipeline(SubscriberConfig::default()).await;
    p.subscriptions
        .save(&bangumi("sub-1", 5, "X"))
        .await
        .unwrap();

    let media = "[X] Foo - 01 [1080p].mkv";
    let subtitle = "[X] Foo - 01 [1080p].zh.ass";
    std::fs::write(p.downloads.path().join(media), b"video").unwrap();
    std::fs::write(p.downloads.path().join(subtitle), b"subs").unwrap();

    let hash = "b".repeat(40);
    p.torrents
        .save(&downloaded_torrent(
            &hash,
            "sub-1",
            p.downloads.path(),
            &[media, subtitle],
        ))
        .await
        .unwrap();

    p.engine.sweep().await;

    let target = p.library.path().join("Foo/Season 1/Foo S01E01.mkv");
    assert!(target.exists(), "media file missing from the library");
    assert!(p
        .library
        .path()
        .join("Foo/Season 1/Foo S01E01.zh.ass")
        .exists());

    let stored = p.torrents.get(&hash).await.unwrap();
    assert_eq!(stored.status, TorrentStatus::Transferred);

    let record = p
        .records
        .get(&GetTransferRecordReq {
            new_file_id: "Foo/1/1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(record.subscription_id, "sub-1");
    assert!(Path::new(&record.new_file).exists());

    assert_eq!(
        p.subscriptions.get("sub-1").await.unwrap().last_air_episode,
        1
    );
    assert_eq!(p.notifier.transferred.lock().len(), 1);
}

#[tokio::test]
async fn episode_offset_applies_before_templating() {
    let p = pipeline(SubscriberConfig::default()).await;
    let mut sub = bangumi("sub-1", 5, "X");
    sub.episode_offset = -12;
    p.subscriptions.save(&sub).await.unwrap();

    let media = "[X] Foo - 13 [1080p].mkv";
    std::fs::write(p.downloads.path().join(media), b"video").unwrap();
    let hash = "c".repeat(40);
    p.torrents
        .save(&downloaded_torrent(&hash, "sub-1", p.downloads.path(), &[media]))
        .await
        .unwrap();

    p.engine.sweep().await;
    assert!(p
        .library
        .path()
        .join("Foo/Season 1/Foo S01E01.mkv")
        .exists());
}

#[tokio::test]
async fn unparsable_episode_marks_transfer_error() {
    let p = pipeline(SubscriberConfig::default()).await;
    p.subscriptions
        .save(&bangumi("sub-1", 5, "X"))
        .await
        .unwrap();

    let media = "[X] Foo OVA [1080p].mkv";
    std::fs::write(p.downloads.path().join(media), b"video").unwrap();
    let hash = "d".repeat(40);
    p.torrents
        .save(&downloaded_torrent(&hash, "sub-1", p.downloads.path(), &[media]))
        .await
        .unwrap();

    p.engine.sweep().await;
    let stored = p.torrents.get(&hash).await.unwrap();
    assert_eq!(stored.status, TorrentStatus::TransferredError);
    assert!(!stored.status_detail.is_empty());
}

#[tokio::test]
async fn higher_priority_overwrites_lower_preserving_nfo() {
    let p = pipeline(SubscriberConfig::default()).await;
    p.subscriptions.save(&bangumi("sub-a", 5, "X")).await.unwrap();
    p.subscriptions.save(&bangumi("sub-b", 10, "Y")).await.unwrap();

    // Subscription A transfers episode 3 first.
    let media_a = "[X] Foo - 03 [1080p].mkv";
    std::fs::write(p.downloads.path().join(media_a), b"video-a").unwrap();
    p.torrents
        .save(&downloaded_torrent(
            &"e".repeat(40),
            "sub-a",
            p.downloads.path(),
            &[media_a],
        ))
        .await
        .unwrap();
    p.engine.sweep().await;

    let target = p.library.path().join("Foo/Season 1/Foo S01E03.mkv");
    assert_eq!(std::fs::read(&target).unwrap(), b"video-a");
    // Scraper output that should survive the override.
    let nfo = p.library.path().join("Foo/Season 1/Foo S01E03.nfo");
    std::fs::write(&nfo, b"<episodedetails/>").unwrap();

    // Subscription B (higher priority) downloads the same episode.
    let dir_b = tempfile::tempdir().unwrap();
    let media_b = "[Y] Foo - 03 [1080p].mkv";
    std::fs::write(dir_b.path().join(media_b), b"video-b").unwrap();
    p.torrents
        .save(&downloaded_torrent(
            &"f".repeat(40),
            "sub-b",
            dir_b.path(),
            &[media_b],
        ))
        .await
        .unwrap();
    p.engine.sweep().await;

    assert_eq!(std::fs::read(&target).unwrap(), b"video-b");
    assert!(nfo.exists(), "nfo must survive the priority override");
    let record = p
        .records
        .get(&GetTransferRecordReq {
            new_file_id: "Foo/1/3".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(record.subscription_id, "sub-b");
}

#[tokio::test]
async fn lower_priority_is_skipped_entirely() {
    let p = pipeline(SubscriberConfig::default()).await;
    p.subscriptions.save(&bangumi("sub-a", 10, "X")).await.unwrap();
    p.subscriptions.save(&bangumi("sub-c", 1, "Z")).await.unwrap();

    let media_a = "[X] Foo - 03 [1080p].mkv";
    std::fs::write(p.downloads.path().join(media_a), b"video-a").unwrap();
    p.torrents
        .save(&downloaded_torrent(
            &"1".repeat(40),
            "sub-a",
            p.downloads.path(),
            &[media_a],
        ))
        .await
        .unwrap();
    p.engine.sweep().await;

    let dir_c = tempfile::tempdir().unwrap();
    let media_c = "[Z] Foo - 03 [720p].mkv";
    std::fs::write(dir_c.path().join(media_c), b"video-c").unwrap();
    p.torrents
        .save(&downloaded_torrent(
            &"2".repeat(40),
            "sub-c",
            dir_c.path(),
            &[media_c],
        ))
        .await
        .unwrap();
    p.engine.sweep().await;

    // The library still holds the higher-priority version...
    let target = p.library.path().join("Foo/Season 1/Foo S01E03.mkv");
    assert_eq!(std::fs::read(&target).unwrap(), b"video-a");
    let record = p
        .records
        .get(&GetTransferRecordReq {
            new_file_id: "Foo/1/3".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(record.subscription_id, "sub-a");
    // ...and the skipped torrent still counts as handled.
    assert_eq!(
        p.torrents.get(&"2".repeat(40)).await.unwrap().status,
        TorrentStatus::Transferred
    );
}

#[tokio::test]
async fn sweep_twice_is_idempotent() {
    let p = pipeline(SubscriberConfig::default()).await;
    p.subscriptions
        .save(&bangumi("sub-1", 5, "X"))
        .await
        .unwrap();
    let media = "[X] Foo - 01 [1080p].mkv";
    std::fs::write(p.downloads.path().join(media), b"video").unwrap();
    p.torrents
        .save(&downloaded_torrent(
            &"3".repeat(40),
            "sub-1",
            p.downloads.path(),
            &[media],
        ))
        .await
        .unwrap();

    p.engine.sweep().await;
    let target = p.library.path().join("Foo/Season 1/Foo S01E01.mkv");
    let modified = std::fs::metadata(&target).unwrap().modified().unwrap();
    let notices = p.notifier.transferred.lock().len();

    // A terminal-status population produces no further filesystem changes.
    p.engine.sweep().await;
    assert_eq!(
        std::fs::metadata(&target).unwrap().modified().unwrap(),
        modified
    );
    assert_eq!(p.notifier.transferred.lock().len(), notices);
}

#[tokio::test]
async fn final_episode_auto_stops_subscription() {
    let p = pipeline(SubscriberConfig {
        auto_stop: true,
        ..Default::default()
    })
    .await;
    let mut sub = bangumi("sub-1", 5, "X");
    sub.last_air_episode = 11;
    p.subscriptions.save(&sub).await.unwrap();

    let media = "[X] Foo - 12 [1080p].mkv";
    std::fs::write(p.downloads.path().join(media), b"video").unwrap();
    p.torrents
        .save(&downloaded_torrent(
            &"4".repeat(40),
            "sub-1",
            p.downloads.path(),
            &[media],
        ))
        .await
        .unwrap();

    p.engine.sweep().await;

    let stored = p.subscriptions.get("sub-1").await.unwrap();
    assert_eq!(stored.last_air_episode, 12);
    assert!(!stored.active, "subscription should be stopped");
}

// ============================================================================
// Magnet-task transfer path
// ============================================================================

#[tokio::test]
async fn magnet_movie_transfer_uses_movie_template_and_file_flags() {
    let p = pipeline(SubscriberConfig::default()).await;

    let hash = "5".repeat(40);
    let task = Task {
        task_id: "task-1".to_string(),
        magnet_link: format!("magnet:?xt=urn:btih:{hash}"),
        torrent: TaskTorrent {
            hash: hash.clone(),
            name: "Foo Movie".to_string(),
            files: vec![
                TorrentFile {
                    file_name: "Foo Movie.mkv".to_string(),
                    media: true,
                    download: true,
                    ..Default::default()
                },
                TorrentFile {
                    file_name: "Extras/NCOP.mkv".to_string(),
                    media: false,
                    download: true,
                    ..Default::default()
                },
            ],
            size: 2048,
        },
        created_at: Utc::now(),
        download_type: DownloadType::Movie,
        meta: TaskMeta {
            chinese_name: "Foo Movie".to_string(),
            year: "2026".to_string(),
            tmdb_id: 200,
            release_group: "X".to_string(),
        },
        status: TaskStatus::InitSuccess,
    };
    p.tasks.save(&task).await.unwrap();

    std::fs::write(p.downloads.path().join("Foo Movie.mkv"), b"movie").unwrap();
    std::fs::create_dir_all(p.downloads.path().join("Extras")).unwrap();
    std::fs::write(p.downloads.path().join("Extras/NCOP.mkv"), b"extra").unwrap();

    let mut torrent = downloaded_torrent(
        &hash,
        "",
        p.downloads.path(),
        &["Foo Movie.mkv", "Extras/NCOP.mkv"],
    );
    torrent.task_id = "task-1".to_string();
    p.torrents.save(&torrent).await.unwrap();

    p.engine.sweep().await;

    assert!(p
        .library
        .path()
        .join("movies/Foo Movie (2026).mkv")
        .exists());
    // Non-library files stay out of the library.
    assert!(!p.library.path().join("movies/NCOP.mkv").exists());
    assert_eq!(
        p.torrents.get(&hash).await.unwrap().status,
        TorrentStatus::Transferred
    );
}

// ============================================================================
// RSS-processed bookkeeping
// ============================================================================

#[tokio::test]
async fn processed_guid_rows_match_dispatched_torrents() {
    let p = pipeline(SubscriberConfig::default()).await;
    let records = RssRecordRepository::new(p.pool.clone());
    records
        .mark_processed("sub-1", &["guid-1".to_string()])
        .await
        .unwrap();
    assert!(records.is_processed("sub-1", "guid-1").await.unwrap());

    // Un-marking makes the item eligible for re-dispatch.
    records
        .delete_processed("sub-1", &["guid-1".to_string()])
        .await
        .unwrap();
    assert!(!records.is_processed("sub-1", "guid-1").await.unwrap());
}
