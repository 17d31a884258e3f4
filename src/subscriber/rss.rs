//! RSS feed fetching and parsing.
//!
//! Feeds follow the Mikan layout: the channel title carries the show name,
//! items carry a GUID (the release title), an enclosure pointing at the
//! torrent file and a publish date.

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Parsed feed.
#[derive(Debug, Clone, Default)]
pub struct Rss {
    pub bangumi_name: String,
    pub release_group: String,
    pub items: Vec<RssItem>,
}

#[derive(Debug, Clone, Default)]
pub struct RssItem {
    pub guid: String,
    pub torrent_link: String,
    pub published_at: Option<DateTime<Utc>>,
}

pub struct RssService {
    client: Client,
}

impl RssService {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent("bangumid/0.4")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("build rss http client");
        Self { client }
    }

    pub async fn fetch(&self, url: &str) -> Result<Rss> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "rss feed returned status {}",
                response.status()
            )));
        }
        let content = response.text().await?;
        self.parse(&content)
            .map_err(|e| Error::upstream(format!("parse rss feed: {e}")))
    }

    /// Parses RSS XML into a feed structure.
    pub fn parse(&self, content: &str) -> anyhow::Result<Rss> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut rss = Rss::default();
        let mut current_item: Option<ItemBuilder> = None;
        let mut current_tag = String::new();
        let mut in_item = false;
        let mut in_channel_title = false;

        loop {
            match reader.read_event().context("read rss event")? {
                Event::Start(ref e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match tag.as_str() {
                        "item" => {
                            in_item = true;
                            current_item = Some(ItemBuilder::default());
                        }
                        "title" if !in_item => in_channel_title = true,
                        _ => {}
                    }
                    current_tag = tag;
                }
                Event::Empty(ref e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if in_item && tag == "enclosure" {
                        if let Some(ref mut builder) = current_item {
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"url" {
                                    builder.enclosure =
                                        Some(String::from_utf8_lossy(&attr.value).to_string());
                                }
                            }
                        }
                    }
                }
                Event::End(ref e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if tag == "item" {
                        in_item = false;
                        if let Some(builder) = current_item.take() {
                            if let Some(item) = builder.build() {
                                rss.items.push(item);
                            }
                        }
                    }
                    in_channel_title = false;
                    current_tag.clear();
                }
                Event::Text(ref e) => {
                    let text = e.unescape().unwrap_or_default().to_string();
                    if in_channel_title && rss.bangumi_name.is_empty() {
                        rss.bangumi_name = bangumi_name_from_title(&text);
                    } else if in_item {
                        if let Some(ref mut builder) = current_item {
                            match current_tag.as_str() {
                                "guid" | "title" => {
                                    // GUID preferred; title fills in when absent.
                                    if current_tag == "guid" || builder.guid.is_none() {
                                        builder.guid = Some(text);
                                    }
                                }
                                "link" => builder.link = Some(text),
                                "pubDate" => builder.pub_date = Some(text),
                                _ => {}
                            }
                        }
                    }
                }
                Event::CData(ref e) => {
                    let text = String::from_utf8_lossy(e.as_ref()).to_string();
                    if in_channel_title && rss.bangumi_name.is_empty() {
                        rss.bangumi_name = bangumi_name_from_title(&text);
                    } else if in_item {
                        if let Some(ref mut builder) = current_item {
                            if current_tag == "guid" || current_tag == "title" {
                                if current_tag == "guid" || builder.guid.is_none() {
                                    builder.guid = Some(text);
                                }
                            }
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        rss.release_group = rss
            .items
            .first()
            .map(|item| crate::transfer::episode::parse_release_group(&item.guid))
            .unwrap_or_default();
        debug!(
            name = %rss.bangumi_name,
            items = rss.items.len(),
            "parsed rss feed"
        );
        Ok(rss)
    }
}

impl Default for RssService {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct ItemBuilder {
    guid: Option<String>,
    link: Option<String>,
    enclosure: Option<String>,
    pub_date: Option<String>,
}

impl ItemBuilder {
    fn build(self) -> Option<RssItem> {
        let guid = self.guid?;
        let torrent_link = self.enclosure.or(self.link)?;
        let published_at = self.pub_date.as_deref().and_then(parse_rss_date);
        Some(RssItem {
            guid,
            torrent_link,
            published_at,
        })
    }
}

/// Extracts the show name from a Mikan-style channel title.
fn bangumi_name_from_title(title: &str) -> String {
    let re = Regex::new(r"Mikan Project - (.+?)(?:\s*第|$)").unwrap();
    if let Some(caps) = re.captures(title) {
        return caps.get(1).unwrap().as_str().to_string();
    }
    if let Some(stripped) = title.strip_prefix("Mikan Project - ") {
        return stripped.to_string();
    }
    warn!(title, "could not isolate show name from feed title");
    title.to_string()
}

fn parse_rss_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Mikan embeds a timezone-less local timestamp.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.3f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    debug!(date = s, "failed to parse rss date");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_feed_extracts_items_and_group() {
        let rss = RssService::new();
        let content = r#"
        <rss version="2.0">
        <channel>
            <title>Mikan Project - 葬送的芙莉莲</title>
            <item>
                <guid>[SweetSub] Frieren - 01 [1080p][AVC 8bit][CHS]</guid>
                <link>https://mikan.example/Episode/abc</link>
                <enclosure url="https://mikan.example/Download/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.torrent" type="application/x-bittorrent"/>
                <pubDate>Wed, 08 Jan 2026 10:01:59 +0000</pubDate>
            </item>
            <item>
                <guid>[SweetSub] Frieren - 02 [1080p][AVC 8bit][CHS]</guid>
                <link>https://mikan.example/Episode/def</link>
                <enclosure url="https://mikan.example/Download/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb.torrent" type="application/x-bittorrent"/>
            </item>
        </channel>
        </rss>
        "#;

        let feed = rss.parse(content).unwrap();
        assert_eq!(feed.bangumi_name, "葬送的芙莉莲");
        assert_eq!(feed.release_group, "SweetSub");
        assert_eq!(feed.items.len(), 2);
        assert!(feed.items[0].torrent_link.ends_with(".torrent"));
        assert!(feed.items[0].published_at.is_some());
        assert!(feed.items[1].published_at.is_none());
    }

    #[test]
    fn channel_title_season_suffix_is_stripped() {
        assert_eq!(bangumi_name_from_title("Mikan Project - 某科学 第二季"), "某科学");
        assert_eq!(bangumi_name_from_title("Plain Feed"), "Plain Feed");
    }

    #[test]
    fn items_without_enclosure_fall_back_to_link() {
        let rss = RssService::new();
        let content = r#"
        <rss><channel><title>T</title>
        <item>
            <guid>release-1</guid>
            <link>https://example.com/release-1.torrent</link>
        </item>
        </channel></rss>
        "#;
        let feed = rss.parse(content).unwrap();
        assert_eq!(feed.items[0].torrent_link, "https://example.com/release-1.torrent");
    }
}
