//! Subscriber: periodic RSS polling, filtering, deduplication and download
//! dispatch, plus the subscription CRUD the API exposes.

pub mod rss;

pub use rss::{Rss, RssItem, RssService};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Reloadable;
use crate::db::{RssRecordRepository, SubscriptionRepository};
use crate::downloader::{DownloadManager, DownloadReq, DownloadType};
use crate::error::{Error, Result};
use crate::meta::MetaProvider;
use crate::notify::{Notifier, SubscriptionUpdatedNotice};

/// One subscription: a show-season-releaseGroup triple bound to an RSS feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bangumi {
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    pub name: String,
    pub rss_link: String,
    pub active: bool,
    pub include_regs: Vec<String>,
    pub exclude_regs: Vec<String>,
    pub priority: i64,
    pub episode_offset: i64,
    pub season: i64,
    pub year: String,
    #[serde(rename = "tmdbID")]
    pub tmdb_id: i64,
    pub release_group: String,
    /// Pattern containing `{ep}` locating the episode number in file names.
    pub episode_location: String,
    #[serde(rename = "posterURL")]
    pub poster_url: String,
    #[serde(rename = "backdropURL")]
    pub backdrop_url: String,
    pub overview: String,
    pub genres: String,
    /// 0 = Sunday … 6 = Saturday.
    pub air_weekday: i64,
    pub episode_total_num: i64,
    pub last_air_episode: i64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionFilter {
    pub active: Option<bool>,
    #[serde(default)]
    pub fuzz_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub season: i64,
    #[serde(default)]
    pub subscription_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeReq {
    pub rss_link: String,
    pub season: i64,
    #[serde(default)]
    pub include_regs: Vec<String>,
    #[serde(default)]
    pub exclude_regs: Vec<String>,
    #[serde(default)]
    pub episode_offset: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(rename = "tmdbID")]
    pub tmdb_id: i64,
    pub release_group: String,
    #[serde(default)]
    pub episode_location: String,
    pub episode_total_num: i64,
    #[serde(default)]
    pub air_weekday: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscribeReq {
    #[serde(skip)]
    pub subscription_id: String,
    pub active: bool,
    #[serde(default)]
    pub include_regs: Vec<String>,
    #[serde(default)]
    pub exclude_regs: Vec<String>,
    #[serde(default)]
    pub episode_offset: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub episode_location: String,
    #[serde(default)]
    pub episode_total_num: i64,
    #[serde(default)]
    pub air_weekday: i64,
}

/// Feed preview returned before the user confirms a subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseRssRsp {
    pub name: String,
    pub season: i64,
    pub year: String,
    #[serde(rename = "tmdbID")]
    pub tmdb_id: i64,
    pub rss_link: String,
    pub release_group: String,
    pub episode_total_num: i64,
    pub air_weekday: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RssMatch {
    pub guid: String,
    #[serde(rename = "match")]
    pub matched: bool,
    pub processed: bool,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRssRecordReq {
    #[serde(skip)]
    pub subscription_id: String,
    pub guids: Vec<String>,
    pub processed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarItem {
    pub bangumi_name: String,
    #[serde(rename = "posterURL")]
    pub poster_url: String,
    pub season: i64,
}

fn default_check_interval() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// RSS poll interval in minutes.
    #[serde(default = "default_check_interval")]
    pub rss_check_interval: u64,
    /// Global include patterns, joined with every subscription's own.
    #[serde(default)]
    pub include_regs: Vec<String>,
    /// Global exclude patterns, joined with every subscription's own.
    #[serde(default)]
    pub exclude_regs: Vec<String>,
    /// Stop a subscription once its final episode transferred.
    #[serde(default)]
    pub auto_stop: bool,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            rss_check_interval: default_check_interval(),
            include_regs: Vec::new(),
            exclude_regs: Vec::new(),
            auto_stop: false,
        }
    }
}

pub struct Subscriber {
    rss: RssService,
    meta: Arc<dyn MetaProvider>,
    repo: SubscriptionRepository,
    rss_records: RssRecordRepository,
    manager: Arc<DownloadManager>,
    notifier: Arc<dyn Notifier>,
    config: RwLock<SubscriberConfig>,
    interval: watch::Sender<Duration>,
    stop: watch::Sender<bool>,
}

impl Subscriber {
    pub fn new(
        meta: Arc<dyn MetaProvider>,
        repo: SubscriptionRepository,
        rss_records: RssRecordRepository,
        manager: Arc<DownloadManager>,
        notifier: Arc<dyn Notifier>,
        config: SubscriberConfig,
    ) -> Arc<Self> {
        let (interval, _) =
            watch::channel(Duration::from_secs(config.rss_check_interval.max(1) * 60));
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            rss: RssService::new(),
            meta,
            repo,
            rss_records,
            manager,
            notifier,
            config: RwLock::new(config),
            interval,
            stop,
        })
    }

    /// Spawns the RSS polling loop.
    pub fn start(self: &Arc<Self>) {
        let subscriber = self.clone();
        let mut stop = self.stop.subscribe();
        let mut interval = self.interval.subscribe();
        tokio::spawn(async move {
            loop {
                let period = *interval.borrow();
                tokio::select! {
                    _ = tokio::time::sleep(period) => subscriber.handle_subscriptions().await,
                    // Interval changed by a config reload: restart the wait.
                    _ = interval.changed() => continue,
                    _ = stop.changed() => return,
                }
            }
        });
    }

    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    pub async fn parse_rss(&self, rss_link: &str) -> Result<ParseRssRsp> {
        if rss_link.is_empty() {
            return Err(Error::bad_request("rss link cannot be empty"));
        }
        let feed = self.rss.fetch(rss_link).await?;
        let meta = self.meta.search_tv(&feed.bangumi_name).await?;
        Ok(ParseRssRsp {
            name: meta.chinese_name,
            season: meta.season,
            year: meta.year,
            tmdb_id: meta.tmdb_id,
            rss_link: rss_link.to_string(),
            release_group: feed.release_group,
            episode_total_num: meta.episode_total_num,
            air_weekday: meta.air_weekday,
        })
    }

    pub async fn subscribe(&self, req: SubscribeReq) -> Result<Bangumi> {
        let meta = self.meta.parse_tv(req.tmdb_id).await?;
        let bangumi = Bangumi {
            subscription_id: Uuid::new_v4().to_string(),
            name: meta.chinese_name,
            rss_link: req.rss_link,
            active: true,
            include_regs: req.include_regs,
            exclude_regs: req.exclude_regs,
            priority: req.priority,
            episode_offset: req.episode_offset,
            season: req.season,
            year: meta.year,
            tmdb_id: req.tmdb_id,
            release_group: req.release_group,
            episode_location: req.episode_location,
            poster_url: meta.poster_url,
            backdrop_url: meta.backdrop_url,
            overview: meta.overview,
            genres: meta.genres,
            air_weekday: req.air_weekday,
            episode_total_num: req.episode_total_num,
            last_air_episode: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.repo.save(&bangumi).await?;
        Ok(bangumi)
    }

    pub async fn get(&self, id: &str) -> Result<Bangumi> {
        self.repo.get(id).await
    }

    pub async fn list(&self, filter: &SubscriptionFilter) -> Result<Vec<Bangumi>> {
        self.repo.list(filter).await
    }

    pub async fn update_subscription(&self, req: UpdateSubscribeReq) -> Result<()> {
        if req.subscription_id.is_empty() {
            return Err(Error::bad_request("subscription id cannot be empty"));
        }
        let mut bangumi = self.get(&req.subscription_id).await?;
        // Refresh the synopsis while we're at it; ignore lookup failures.
        if let Ok(meta) = self.meta.parse_tv(bangumi.tmdb_id).await {
            bangumi.overview = meta.overview;
            bangumi.genres = meta.genres;
        }
        bangumi.active = req.active;
        bangumi.include_regs = req.include_regs;
        bangumi.exclude_regs = req.exclude_regs;
        bangumi.episode_offset = req.episode_offset;
        bangumi.priority = req.priority;
        bangumi.episode_location = req.episode_location;
        bangumi.episode_total_num = req.episode_total_num;
        bangumi.air_weekday = req.air_weekday;
        self.repo.save(&bangumi).await
    }

    pub async fn delete_subscription(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::bad_request("subscription id cannot be empty"));
        }
        self.rss_records.delete_by_subscription(id).await?;
        self.repo.delete(id).await
    }

    pub async fn update_last_air_episode(&self, id: &str, episode: i64) -> Result<()> {
        self.repo.update_last_air_episode(id, episode).await
    }

    pub async fn stop_subscription(&self, id: &str) -> Result<()> {
        self.repo.stop(id).await
    }

    pub fn auto_stop_enabled(&self) -> bool {
        self.config.read().auto_stop
    }

    async fn handle_subscriptions(&self) {
        let bangumis = match self
            .repo
            .list(&SubscriptionFilter {
                active: Some(true),
                ..Default::default()
            })
            .await
        {
            Ok(list) => list,
            Err(err) => {
                error!(error = %err, "list active subscriptions failed");
                return;
            }
        };

        for bangumi in bangumis {
            if let Err(err) = self.handle_bangumi(&bangumi).await {
                error!(
                    subscription = %bangumi.subscription_id,
                    name = %bangumi.name,
                    error = %err,
                    "subscription poll failed"
                );
            }
        }
    }

    /// Runs one subscription's poll cycle. Per-item errors accumulate and
    /// never abort the remaining items.
    pub async fn handle_bangumi(&self, bangumi: &Bangumi) -> Result<()> {
        let feed = self
            .rss
            .fetch(&bangumi.rss_link)
            .await
            .map_err(|e| Error::upstream(format!("parse rss of {}: {e}", bangumi.name)))?;

        let mut item_errors = Vec::new();
        for item in &feed.items {
            if !self.matches_filters(&item.guid, &bangumi.include_regs, &bangumi.exclude_regs) {
                continue;
            }

            match self
                .rss_records
                .is_processed(&bangumi.subscription_id, &item.guid)
                .await
            {
                Ok(true) => {
                    info!(guid = %item.guid, "item already processed, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    item_errors.push(format!("check processed state of {}: {err}", item.guid));
                    continue;
                }
            }

            let hash = extract_hash_from_link(&item.torrent_link);
            let download_result = self
                .manager
                .download(DownloadReq {
                    torrent_link: item.torrent_link.clone(),
                    hash,
                    save_path: format!("/{}/Season {}/", bangumi.name, bangumi.season),
                    subscription_id: bangumi.subscription_id.clone(),
                    tmdb_id: bangumi.tmdb_id,
                    download_type: Some(DownloadType::Tv),
                    rss_guid: item.guid.clone(),
                    ..Default::default()
                })
                .await;

            if let Err(err) = self
                .notifier
                .notice_subscription_updated(SubscriptionUpdatedNotice {
                    bangumi_name: bangumi.name.clone(),
                    season: bangumi.season,
                    release_group: bangumi.release_group.clone(),
                    rss_guid: item.guid.clone(),
                    poster: bangumi.poster_url.clone(),
                    error: download_result.as_ref().err().map(|e| e.to_string()),
                })
                .await
            {
                warn!(guid = %item.guid, error = %err, "subscription-updated notification failed");
            }

            if let Err(err) = download_result {
                item_errors.push(format!("download {}: {err}", item.guid));
                continue;
            }

            // Written after the dispatch so a crash in between re-dispatches
            // next tick; the client dedupes on hash.
            if let Err(err) = self
                .rss_records
                .mark_processed(&bangumi.subscription_id, std::slice::from_ref(&item.guid))
                .await
            {
                item_errors.push(format!("mark {} processed: {err}", item.guid));
                continue;
            }

            info!(guid = %item.guid, "download task dispatched");
        }

        if item_errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(anyhow::anyhow!(item_errors.join("; "))))
        }
    }

    /// Force-runs one subscription (the POST …/download endpoint).
    pub async fn handle_bangumi_subscription(&self, subscription_id: &str) -> Result<()> {
        let bangumi = self.get(subscription_id).await?;
        self.handle_bangumi(&bangumi).await
    }

    /// Exclusion first; then every include pattern (local and global) must
    /// match. An empty include set accepts everything not excluded.
    fn matches_filters(&self, guid: &str, include: &[String], exclude: &[String]) -> bool {
        let config = self.config.read();
        let excludes = exclude.iter().chain(config.exclude_regs.iter());
        for pattern in excludes {
            if let Ok(re) = Regex::new(pattern) {
                if re.is_match(guid) {
                    return false;
                }
            }
        }
        let includes: Vec<_> = include.iter().chain(config.include_regs.iter()).collect();
        if includes.is_empty() {
            return true;
        }
        includes.iter().all(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(guid))
                .unwrap_or(false)
        })
    }

    pub async fn get_rss_match(&self, subscription_id: &str) -> Result<Vec<RssMatch>> {
        let bangumi = self.get(subscription_id).await?;
        let feed = self.rss.fetch(&bangumi.rss_link).await?;
        let processed: std::collections::HashSet<String> = self
            .rss_records
            .list_processed_guids(subscription_id)
            .await?
            .into_iter()
            .collect();

        Ok(feed
            .items
            .iter()
            .map(|item| RssMatch {
                guid: item.guid.clone(),
                matched: self.matches_filters(
                    &item.guid,
                    &bangumi.include_regs,
                    &bangumi.exclude_regs,
                ),
                processed: processed.contains(&item.guid),
                published_at: item.published_at,
            })
            .collect())
    }

    pub async fn mark_rss_record(&self, req: MarkRssRecordReq) -> Result<()> {
        if req.processed {
            self.rss_records
                .mark_processed(&req.subscription_id, &req.guids)
                .await
        } else {
            self.rss_records
                .delete_processed(&req.subscription_id, &req.guids)
                .await
        }
    }

    /// Active subscriptions grouped by weekday, deduplicated on
    /// `(name, season)`.
    pub async fn get_subscription_calendar(&self) -> Result<BTreeMap<i64, Vec<CalendarItem>>> {
        let bangumis = self
            .repo
            .list(&SubscriptionFilter {
                active: Some(true),
                ..Default::default()
            })
            .await?;

        let mut calendar: BTreeMap<i64, Vec<CalendarItem>> = BTreeMap::new();
        for bangumi in bangumis {
            let slot = calendar.entry(bangumi.air_weekday).or_default();
            let item = CalendarItem {
                bangumi_name: bangumi.name,
                poster_url: bangumi.poster_url,
                season: bangumi.season,
            };
            if !slot
                .iter()
                .any(|e| e.bangumi_name == item.bangumi_name && e.season == item.season)
            {
                slot.push(item);
            }
        }
        Ok(calendar)
    }
}

impl Reloadable for Subscriber {
    fn reload(&self, config: serde_yaml::Value) -> anyhow::Result<()> {
        let config: SubscriberConfig = serde_yaml::from_value(config)?;
        let _ = self
            .interval
            .send(Duration::from_secs(config.rss_check_interval.max(1) * 60));
        *self.config.write() = config;
        Ok(())
    }
}

/// The info-hash is the link's basename without its `.torrent` suffix. A
/// basename without the suffix passes through verbatim.
pub fn extract_hash_from_link(torrent_link: &str) -> String {
    let base = torrent_link
        .rsplit('/')
        .next()
        .unwrap_or(torrent_link);
    base.strip_suffix(".torrent").unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::manager::tests::{NullNotifier, StubDownloader};
    use crate::downloader::DownloadManagerConfig;
    use crate::meta::{EpisodeDetails, Meta};

    pub struct StaticMeta;

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
                tmdb_id,
                ..Default::default()
            })
        }
        async fn episode_details(&self, _: i64, _: i64, _: i64) -> Result<EpisodeDetails> {
            Ok(EpisodeDetails::default())
        }
    }

    async fn make_subscriber(config: SubscriberConfig) -> Arc<Subscriber> {
        let pool = crate::db::open_test_db().await;
        let manager = crate::downloader::DownloadManager::new(
            Arc::new(StubDownloader::default()),
            crate::db::TorrentRepository::new(pool.clone()),
            Arc::new(NullNotifier),
            DownloadManagerConfig::default(),
        );
        Subscriber::new(
            Arc::new(StaticMeta),
            SubscriptionRepository::new(pool.clone()),
            RssRecordRepository::new(pool),
            manager,
            Arc::new(NullNotifier),
            config,
        )
    }

    #[test]
    fn hash_extraction_from_links() {
        assert_eq!(
            extract_hash_from_link("https://mikan.example/Download/abcdef.torrent"),
            "abcdef"
        );
        // No `.torrent` suffix: the basename passes through verbatim.
        assert_eq!(extract_hash_from_link("https://x/dl/abcdef"), "abcdef");
    }

    #[tokio::test]
    async fn filters_exclude_first_then_require_all_includes() {
        let subscriber = make_subscriber(SubscriberConfig::default()).await;
        let include = vec!["1080p".to_string(), "CHS".to_string()];
        let exclude = vec!["720p".to_string()];

        assert!(subscriber.matches_filters("[G] Foo - 01 [1080p][CHS]", &include, &exclude));
        assert!(!subscriber.matches_filters("[G] Foo - 01 [720p][1080p][CHS]", &include, &exclude));
        assert!(!subscriber.matches_filters("[G] Foo - 01 [1080p]", &include, &exclude));

        // Empty include list accepts everything not excluded.
        assert!(subscriber.matches_filters("[G] Foo - 01 [480p]", &[], &exclude));
    }

    #[tokio::test]
    async fn global_filters_join_subscription_filters() {
        let subscriber = make_subscriber(SubscriberConfig {
            exclude_regs: vec!["HEVC".to_string()],
            ..Default::default()
        })
        .await;
        assert!(!subscriber.matches_filters("[G] Foo [1080p][HEVC]", &[], &[]));
        assert!(subscriber.matches_filters("[G] Foo [1080p][AVC]", &[], &[]));
    }

    #[tokio::test]
    async fn subscribe_then_get_round_trips_user_fields() {
        let subscriber = make_subscriber(SubscriberConfig::default()).await;
        let created = subscriber
            .subscribe(SubscribeReq {
                rss_link: "https://mikan.example/rss/1".to_string(),
                season: 2,
                include_regs: vec!["1080p".to_string()],
                exclude_regs: vec![],
                episode_offset: -12,
                priority: 7,
                tmdb_id: 100,
                release_group: "SweetSub".to_string(),
                episode_location: String::new(),
                episode_total_num: 12,
                air_weekday: 5,
            })
            .await
            .unwrap();

        let stored = subscriber.get(&created.subscription_id).await.unwrap();
        assert_eq!(stored.season, 2);
        assert_eq!(stored.priority, 7);
        assert_eq!(stored.episode_offset, -12);
        assert_eq!(stored.include_regs, vec!["1080p"]);
        assert_eq!(stored.release_group, "SweetSub");
        assert!(stored.active);
    }

    #[tokio::test]
    async fn calendar_dedupes_on_name_and_season() {
        let subscriber = make_subscriber(SubscriberConfig::default()).await;
        for (id, link, group) in [
            ("a", "https://x/rss/1", "G1"),
            ("b", "https://x/rss/2", "G2"),
        ] {
            let mut bangumi = Bangumi {
                subscription_id: id.to_string(),
                name: "Foo".to_string(),
                rss_link: link.to_string(),
                active: true,
                season: 1,
                release_group: group.to_string(),
                air_weekday: 3,
                ..Default::default()
            };
            bangumi.created_at = Utc::now();
            subscriber.repo.save(&bangumi).await.unwrap();
        }

        let calendar = subscriber.get_subscription_calendar().await.unwrap();
        assert_eq!(calendar.get(&3).map(|v| v.len()), Some(1));
    }
}
