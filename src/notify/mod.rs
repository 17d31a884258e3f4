//! Notification fan-out: a single interface with four event types, one
//! configured channel (email, Telegram, Bark or none) and independent
//! per-event gates. Error-bearing events route through the error gate.

pub mod bark;
pub mod email;
pub mod telegram;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Reloadable;
use crate::error::Result;
use crate::util::{average_speed, format_duration, format_file_size};

use bark::{BarkConfig, BarkNotifier};
use email::{EmailConfig, EmailNotifier};
use telegram::{TelegramConfig, TelegramNotifier};

#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdatedNotice {
    pub bangumi_name: String,
    pub season: i64,
    pub release_group: String,
    pub rss_guid: String,
    pub poster: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadedNotice {
    pub rss_guid: String,
    pub torrent_name: String,
    pub failed: bool,
    pub fail_detail: String,
    pub cost: Duration,
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionTransferredNotice {
    pub rss_guid: String,
    pub file_name: String,
    pub bangumi_name: String,
    pub season: i64,
    pub release_group: String,
    pub poster: String,
    pub media_file_path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskTransferredNotice {
    pub bangumi_name: String,
    pub torrent_name: String,
    /// Origin path -> new library path for every successfully moved file.
    pub media_file_paths: HashMap<String, String>,
    pub error: Option<String>,
}

/// A rendered notification; channels decide how to present it.
#[derive(Debug, Clone)]
pub struct Notice {
    pub title: String,
    pub body: String,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notice_subscription_updated(&self, req: SubscriptionUpdatedNotice) -> Result<()>;
    async fn notice_downloaded(&self, req: DownloadedNotice) -> Result<()>;
    async fn notice_subscription_transferred(
        &self,
        req: SubscriptionTransferredNotice,
    ) -> Result<()>;
    async fn notice_task_transferred(&self, req: TaskTransferredNotice) -> Result<()>;
}

/// A concrete delivery channel; the rendering above it is shared.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, notice: Notice) -> Result<()>;
}

struct EmptyChannel;

#[async_trait::async_trait]
impl Channel for EmptyChannel {
    async fn send(&self, _notice: Notice) -> Result<()> {
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticePoints {
    #[serde(default)]
    pub subscription_updated: bool,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default = "default_true")]
    pub transferred: bool,
    #[serde(default = "default_true")]
    pub error: bool,
}

impl Default for NoticePoints {
    fn default() -> Self {
        Self {
            subscription_updated: false,
            downloaded: false,
            transferred: true,
            error: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoticeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `"email"`, `"telegram"`, `"bark"` or empty.
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub bark: BarkConfig,
    #[serde(default)]
    pub notice_points: NoticePoints,
}

/// Gated dispatcher in front of the configured channel.
pub struct NotifyAdapter {
    channel: RwLock<Arc<dyn Channel>>,
    config: RwLock<NoticeConfig>,
}

impl NotifyAdapter {
    pub fn new(config: NoticeConfig) -> Self {
        Self {
            channel: RwLock::new(Self::select(&config)),
            config: RwLock::new(config),
        }
    }

    fn select(config: &NoticeConfig) -> Arc<dyn Channel> {
        match config.r#type.as_str() {
            "email" => Arc::new(EmailNotifier::new(config.email.clone())),
            "telegram" => Arc::new(TelegramNotifier::new(config.telegram.clone())),
            "bark" => Arc::new(BarkNotifier::new(config.bark.clone())),
            _ => Arc::new(EmptyChannel),
        }
    }

    /// Whether an event with `error` presence should go out at all.
    fn pass_gate(&self, failed: bool, success_gate: impl Fn(&NoticePoints) -> bool) -> bool {
        let config = self.config.read();
        if !config.enabled {
            return false;
        }
        if failed {
            config.notice_points.error
        } else {
            success_gate(&config.notice_points)
        }
    }

    async fn dispatch(&self, notice: Notice) -> Result<()> {
        let channel = self.channel.read().clone();
        channel.send(notice).await
    }
}

impl Reloadable for NotifyAdapter {
    fn reload(&self, config: serde_yaml::Value) -> anyhow::Result<()> {
        let config: NoticeConfig = serde_yaml::from_value(config)?;
        *self.channel.write() = Self::select(&config);
        *self.config.write() = config;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Notifier for NotifyAdapter {
    async fn notice_subscription_updated(&self, req: SubscriptionUpdatedNotice) -> Result<()> {
        if !self.pass_gate(req.error.is_some(), |p| p.subscription_updated) {
            return Ok(());
        }
        let title = format!(
            "Subscription updated: {} Season {} [{}]",
            req.bangumi_name, req.season, req.release_group
        );
        let body = match &req.error {
            Some(err) => format!("{}\ndispatch failed: {err}", req.rss_guid),
            None => format!("{}\nsent to downloader", req.rss_guid),
        };
        self.dispatch(Notice { title, body }).await
    }

    async fn notice_downloaded(&self, req: DownloadedNotice) -> Result<()> {
        if !self.pass_gate(req.failed, |p| p.downloaded) {
            return Ok(());
        }
        let notice = if req.failed {
            Notice {
                title: format!("Download failed: {}", req.torrent_name),
                body: format!("{}\n{}", req.rss_guid, req.fail_detail),
            }
        } else {
            Notice {
                title: format!("Download finished: {}", req.torrent_name),
                body: format!(
                    "size {} · took {} · avg {}",
                    format_file_size(req.size),
                    format_duration(req.cost),
                    average_speed(req.size, req.cost),
                ),
            }
        };
        self.dispatch(notice).await
    }

    async fn notice_subscription_transferred(
        &self,
        req: SubscriptionTransferredNotice,
    ) -> Result<()> {
        if !self.pass_gate(req.error.is_some(), |p| p.transferred) {
            return Ok(());
        }
        let title = format!(
            "Transferred: {} Season {} [{}]",
            req.bangumi_name, req.season, req.release_group
        );
        let body = match &req.error {
            Some(err) => format!("{} transfer failed: {err}", req.file_name),
            None => format!("{} -> {}", req.file_name, req.media_file_path),
        };
        self.dispatch(Notice { title, body }).await
    }

    async fn notice_task_transferred(&self, req: TaskTransferredNotice) -> Result<()> {
        if !self.pass_gate(req.error.is_some(), |p| p.transferred) {
            return Ok(());
        }
        let title = format!("Task transferred: {}", req.bangumi_name);
        let mut body = format!("torrent: {}\n", req.torrent_name);
        for (origin, new_path) in &req.media_file_paths {
            body.push_str(&format!("{origin} -> {new_path}\n"));
        }
        if let Some(err) = &req.error {
            body.push_str(&format!("errors: {err}\n"));
        }
        self.dispatch(Notice { title, body }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Channel for Counting {
        async fn send(&self, _notice: Notice) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn adapter_with_counter(config: NoticeConfig) -> (NotifyAdapter, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let adapter = NotifyAdapter::new(config);
        *adapter.channel.write() = Arc::new(Counting(count.clone()));
        (adapter, count)
    }

    #[tokio::test]
    async fn disabled_short_circuits_everything() {
        let (adapter, count) = adapter_with_counter(NoticeConfig::default());
        adapter
            .notice_downloaded(DownloadedNotice::default())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn error_events_route_through_error_gate() {
        let config = NoticeConfig {
            enabled: true,
            notice_points: NoticePoints {
                subscription_updated: false,
                downloaded: false,
                transferred: false,
                error: true,
            },
            ..Default::default()
        };
        let (adapter, count) = adapter_with_counter(config);

        // Success event: gated off.
        adapter
            .notice_downloaded(DownloadedNotice::default())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Failure event: passes through the error gate.
        adapter
            .notice_downloaded(DownloadedNotice {
                failed: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transferred_gate_defaults_on() {
        let config = NoticeConfig {
            enabled: true,
            ..Default::default()
        };
        let (adapter, count) = adapter_with_counter(config);
        adapter
            .notice_subscription_transferred(SubscriptionTransferredNotice::default())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
