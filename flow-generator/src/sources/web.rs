use crate::config::ScraperConfig;
use crate::discovery::FeedDiscovery;
use crate::fetcher::Fetcher;
use crate::parser::FeedParser;
use crate::scraper::ArticleScraper;
use crate::traits::{FlowRepository, PostRepository, SourceReader};
use crate::types::{GeneratorError, MediaKind, ParsedEntry, RawMedia, RawPost, Result, Source};
use async_trait::async_trait;
use crate::utils;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Natural key of a web entry: `rss_` plus a digest of its permalink.
pub fn entry_key(permalink: &str) -> String {
    utils::keys::digest_key("rss", permalink)
}

/// Reads a website through its feed, enriching each entry from the article page.
pub struct WebSourceReader {
    fetcher: Arc<Fetcher>,
    parser: FeedParser,
    discovery: FeedDiscovery,
    scraper: ArticleScraper,
    flows: Arc<dyn FlowRepository>,
    posts: Arc<dyn PostRepository>,
    config: ScraperConfig,
}

impl WebSourceReader {
    pub fn new(
        fetcher: Arc<Fetcher>,
        discovery: FeedDiscovery,
        scraper: ArticleScraper,
        flows: Arc<dyn FlowRepository>,
        posts: Arc<dyn PostRepository>,
        config: ScraperConfig,
    ) -> Self {
        Self {
            fetcher,
            parser: FeedParser::new(),
            discovery,
            scraper,
            flows,
            posts,
            config,
        }
    }

    pub async fn read(&self, flow_id: Uuid, link: &str, rss_url: Option<&str>, volume: usize) -> Result<Vec<RawPost>> {
        if volume == 0 {
            return Ok(Vec::new());
        }
        let unavailable = |reason: String| GeneratorError::SourceUnavailable {
            link: link.to_string(),
            reason,
        };

        let feed_url = match rss_url {
            Some(url) => url.to_string(),
            None => {
                let found = self
                    .discovery
                    .discover(link)
                    .await
                    .ok_or_else(|| unavailable("no feed found".to_string()))?;
                self.flows.set_source_feed_url(flow_id, link, Some(&found)).await?;
                found
            }
        };

        let fetched = self.fetcher.fetch(&feed_url).await?;
        let content = match fetched.content {
            Some(content) if fetched.success => content,
            _ => return Err(unavailable(fetched.error.unwrap_or_else(|| "empty feed response".to_string()))),
        };
        let feed = self
            .parser
            .parse_feed(&content)
            .map_err(|e| unavailable(e.to_string()))?;

        let mut selected: Vec<(String, ParsedEntry)> = Vec::new();
        for entry in feed.entries {
            if selected.len() >= volume {
                break;
            }
            let key = entry_key(&entry.url);
            if self.posts.post_exists(&key).await? {
                debug!("Skipping known entry {} ({})", entry.url, key);
                continue;
            }
            selected.push((key, entry));
        }

        let items: Vec<RawPost> = join_all(
            selected
                .into_iter()
                .map(|(key, entry)| self.enrich(link, key, entry)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        info!("Web source {} yielded {} items (asked {})", link, items.len(), volume);
        Ok(items)
    }

    /// Re-runs discovery and overwrites the cached feed URL, clearing it when nothing is found.
    pub async fn refresh_feed_url(&self, flow_id: Uuid, link: &str) -> Result<Option<String>> {
        let found = self.discovery.discover(link).await;
        self.flows
            .set_source_feed_url(flow_id, link, found.as_deref())
            .await?;
        match &found {
            Some(url) => info!("Feed for {} refreshed to {}", link, url),
            None => warn!("Feed refresh for {} found nothing", link),
        }
        Ok(found)
    }

    async fn enrich(&self, link: &str, key: String, entry: ParsedEntry) -> Option<RawPost> {
        let page = self.scraper.scrape(&entry.url).await;

        let summary = entry
            .content
            .as_deref()
            .or(entry.summary.as_deref())
            .map(utils::html::html_to_text)
            .unwrap_or_default();
        let body = page
            .as_ref()
            .map(|p| p.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or(summary);

        let title = if entry.title.is_empty() {
            page.as_ref().and_then(|p| p.title.clone()).unwrap_or_default()
        } else {
            entry.title.clone()
        };
        let text = if !title.is_empty() && !body.starts_with(&title) {
            format!("{}\n\n{}", title, body).trim().to_string()
        } else {
            body
        };

        let images: Vec<String> = if entry.images.is_empty() {
            page.as_ref()
                .map(|p| p.images.iter().take(self.config.max_images).cloned().collect())
                .unwrap_or_default()
        } else {
            entry.images.iter().take(self.config.max_feed_images).cloned().collect()
        };

        if text.is_empty() && images.is_empty() {
            debug!("Dropping empty entry {}", entry.url);
            return None;
        }

        Some(RawPost {
            text,
            media: images
                .into_iter()
                .map(|url| RawMedia::remote(MediaKind::Image, url))
                .collect(),
            original_date: entry.published_at.or_else(|| page.as_ref().and_then(|p| p.published_at)),
            original_link: Some(entry.url),
            source_url: link.to_string(),
            source_id: key,
        })
    }
}

#[async_trait]
impl SourceReader for WebSourceReader {
    async fn read(&self, flow_id: Uuid, source: &Source, volume: usize) -> Result<Vec<RawPost>> {
        match source {
            Source::Web { link, rss_url } => WebSourceReader::read(self, flow_id, link, rss_url.as_deref(), volume).await,
            other => Err(GeneratorError::SourceUnavailable {
                link: other.link().to_string(),
                reason: "not a web source".to_string(),
            }),
        }
    }
}
