//! `YouTube` channel and search Atom feeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::json;
use voc_core::{Platform, SourceConfig, YoutubeConfig};

use super::{trim_base_url, wrong_platform};
use crate::adapter::CrawlerAdapter;
use crate::client::PoliteClient;
use crate::error::CrawlError;
use crate::types::{FetchOutcome, RawRecord};

const DEFAULT_BASE_URL: &str = "https://www.youtube.com";

pub struct YoutubeAdapter {
    client: Arc<PoliteClient>,
    base_url: String,
    min_delay: Duration,
}

impl YoutubeAdapter {
    #[must_use]
    pub fn new(client: Arc<PoliteClient>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            min_delay: Platform::Youtube.min_request_delay(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = trim_base_url(base_url);
        self
    }

    #[must_use]
    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    fn feed_url(&self, cfg: &YoutubeConfig) -> Result<String, CrawlError> {
        let (param, value) = match (&cfg.channel_id, &cfg.search_query) {
            (Some(id), _) => ("channel_id", id),
            (None, Some(query)) => ("search_query", query),
            (None, None) => {
                return Err(CrawlError::InvalidConfig(
                    "youtube source needs channel_id or search_query".to_string(),
                ))
            }
        };
        Ok(format!(
            "{}/feeds/videos.xml?{param}={}",
            self.base_url,
            utf8_percent_encode(value, NON_ALPHANUMERIC)
        ))
    }
}

#[async_trait]
impl CrawlerAdapter for YoutubeAdapter {
    fn platform(&self) -> Platform {
        Platform::Youtube
    }

    async fn fetch(&self, config: &SourceConfig, limit: usize) -> FetchOutcome {
        let SourceConfig::Youtube(cfg) = config else {
            return FetchOutcome::failed(wrong_platform(Platform::Youtube, config.platform()));
        };

        let result = async {
            let url = self.feed_url(cfg)?;
            let body = self.client.get_text(&url, self.min_delay).await?;
            parse_feed(&body)
        }
        .await;

        match result {
            Ok(mut records) => {
                records.truncate(limit);
                tracing::debug!(records = records.len(), "crawler: youtube feed parsed");
                FetchOutcome::complete(records)
            }
            Err(e) => FetchOutcome::failed(e),
        }
    }
}

#[derive(Default)]
struct EntryBuilder {
    video_id: String,
    title: String,
    description: String,
    author: String,
    published: String,
    link: Option<String>,
}

impl EntryBuilder {
    fn build(self) -> Option<RawRecord> {
        if self.video_id.is_empty() {
            return None;
        }
        let url = self
            .link
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", self.video_id));
        Some(RawRecord {
            metadata: json!({ "video_id": self.video_id, "channel": self.author }),
            external_id: self.video_id,
            content: self.description,
            title: Some(self.title).filter(|t| !t.is_empty()),
            author_handle: Some(self.author).filter(|a| !a.is_empty()),
            url: Some(url),
            posted_at: DateTime::parse_from_rfc3339(&self.published)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

fn watch_link(e: &BytesStart<'_>) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == b"href")
        .map(|attr| String::from_utf8_lossy(attr.value.as_ref()).into_owned())
        .filter(|href| href.contains("/watch"))
}

/// Parse an Atom video feed into records, one per `<entry>`.
fn parse_feed(xml: &str) -> Result<Vec<RawRecord>, CrawlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entry: Option<EntryBuilder> = None;
    let mut in_author = false;
    let mut current_tag = String::new();
    let mut records = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "entry" => entry = Some(EntryBuilder::default()),
                    "author" => in_author = true,
                    "link" => {
                        if let (Some(entry), Some(href)) = (entry.as_mut(), watch_link(&e)) {
                            entry.link = Some(href);
                        }
                    }
                    _ => {}
                }
                current_tag = name;
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"link" {
                    if let (Some(entry), Some(href)) = (entry.as_mut(), watch_link(&e)) {
                        entry.link = Some(href);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let Some(entry) = entry.as_mut() else {
                    continue;
                };
                let text = e.unescape().unwrap_or_default();
                let field = match current_tag.as_str() {
                    "yt:videoId" => &mut entry.video_id,
                    "title" => &mut entry.title,
                    "media:description" => &mut entry.description,
                    "published" => &mut entry.published,
                    "name" if in_author => &mut entry.author,
                    _ => continue,
                };
                field.push_str(&text);
            }
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"entry" => {
                        if let Some(record) = entry.take().and_then(EntryBuilder::build) {
                            records.push(record);
                        }
                    }
                    b"author" => in_author = false,
                    _ => {}
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CrawlError::Network(format!(
                    "malformed feed at position {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns:media="http://search.yahoo.com/mrss/" xmlns="http://www.w3.org/2005/Atom">
  <title>Acme Channel</title>
  <author><name>Acme</name></author>
  <entry>
    <id>yt:video:abc123</id>
    <yt:videoId>abc123</yt:videoId>
    <title>Acme review &amp; first impressions</title>
    <link rel="alternate" href="https://www.youtube.com/watch?v=abc123"/>
    <author><name>Reviewer One</name></author>
    <published>2024-05-01T12:00:00+00:00</published>
    <media:group>
      <media:title>Acme review</media:title>
      <media:description>The onboarding was confusing but support helped.</media:description>
    </media:group>
  </entry>
  <entry>
    <yt:videoId>def456</yt:videoId>
    <title>Second video</title>
    <published>not a date</published>
  </entry>
</feed>"#;

    #[test]
    fn parses_entries() {
        let records = parse_feed(FEED).expect("parse");
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.external_id, "abc123");
        assert_eq!(first.title.as_deref(), Some("Acme review & first impressions"));
        assert_eq!(first.content, "The onboarding was confusing but support helped.");
        assert_eq!(first.author_handle.as_deref(), Some("Reviewer One"));
        assert_eq!(
            first.url.as_deref(),
            Some("https://www.youtube.com/watch?v=abc123")
        );
        assert!(first.posted_at.is_some());

        let second = &records[1];
        assert_eq!(
            second.url.as_deref(),
            Some("https://www.youtube.com/watch?v=def456")
        );
        assert!(second.posted_at.is_none());
        assert!(second.author_handle.is_none());
    }

    #[test]
    fn feed_url_prefers_channel() {
        let adapter = YoutubeAdapter::new(Arc::new(PoliteClient::new(5, "VocBot").unwrap()))
            .with_base_url("https://yt.test");
        let url = adapter
            .feed_url(&YoutubeConfig {
                channel_id: None,
                search_query: Some("acme app".to_string()),
            })
            .unwrap();
        assert_eq!(url, "https://yt.test/feeds/videos.xml?search_query=acme%20app");
    }
}
