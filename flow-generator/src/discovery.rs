use crate::config::DiscoveryConfig;
use crate::fetcher::Fetcher;
use crate::parser::FeedParser;
use crate::traits::Notifier;
use crate::utils;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Conventional feed locations probed relative to a site root.
pub const COMMON_FEED_PATHS: &[&str] = &[
    "/feed",
    "/rss",
    "/atom.xml",
    "/feed.xml",
    "/rss.xml",
    "/blog/feed",
    "/news/feed",
    "/feed/rss",
    "/feed/atom",
];

#[derive(Debug, Deserialize)]
struct DiscoveryApiResponse {
    rss_feed_url: Option<String>,
}

enum ApiAttempt {
    Found(String),
    Retry(String),
    GiveUp(String),
}

/// Finds a feed URL for a plain website.
pub struct FeedDiscovery {
    fetcher: Arc<Fetcher>,
    parser: FeedParser,
    notifier: Arc<dyn Notifier>,
    config: DiscoveryConfig,
}

impl FeedDiscovery {
    pub fn new(fetcher: Arc<Fetcher>, notifier: Arc<dyn Notifier>, config: DiscoveryConfig) -> Self {
        Self {
            fetcher,
            parser: FeedParser::new(),
            notifier,
            config,
        }
    }

    /// Tries the link itself, then conventional paths, then the discovery API.
    /// `None` when nothing validates.
    pub async fn discover(&self, site: &str) -> Option<String> {
        if self.validate_feed(site).await {
            return Some(site.to_string());
        }

        if let Some(found) = self.probe_conventional_paths(site).await {
            return Some(found);
        }

        if self.config.api_enabled() {
            return self.discover_via_api(site).await;
        }

        debug!("No feed found for {}", site);
        None
    }

    async fn probe_conventional_paths(&self, site: &str) -> Option<String> {
        let root = utils::url::site_root(site)?;
        let base = site.trim_end_matches('/');

        let mut candidates: Vec<String> = Vec::new();
        for path in COMMON_FEED_PATHS {
            for prefix in [base, root.as_str()] {
                let candidate = format!("{}{}", prefix, path);
                if !candidates.contains(&candidate) {
                    candidates.push(candidate);
                }
            }
        }

        for candidate in candidates {
            if self.validate_feed(&candidate).await {
                info!("Discovered feed for {} at {}", site, candidate);
                return Some(candidate);
            }
        }
        None
    }

    /// A candidate is a feed when it parses to at least one entry.
    pub async fn validate_feed(&self, url: &str) -> bool {
        let result = match self.fetcher.probe(url).await {
            Ok(r) => r,
            Err(e) => {
                debug!("Probe of {} errored: {}", url, e);
                return false;
            }
        };
        let Some(content) = result.content.filter(|_| result.success) else {
            return false;
        };
        if !FeedParser::is_valid_feed_content(&content) {
            return false;
        }
        match self.parser.parse_feed(&content) {
            Ok(feed) => !feed.entries.is_empty(),
            Err(_) => false,
        }
    }

    async fn discover_via_api(&self, site: &str) -> Option<String> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.retry_base_ms),
            initial_interval: Duration::from_millis(self.config.retry_base_ms),
            max_interval: Duration::from_millis(self.config.retry_base_ms * 16),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = String::new();
        for attempt in 0..self.config.max_retries.max(1) {
            self.jitter().await;

            match self.call_api(site).await {
                ApiAttempt::Found(url) => {
                    info!("Discovery API returned {} for {}", url, site);
                    return Some(url);
                }
                ApiAttempt::GiveUp(reason) => {
                    last_error = reason;
                    break;
                }
                ApiAttempt::Retry(reason) => {
                    warn!("Discovery API attempt {} for {} failed: {}", attempt + 1, site, reason);
                    last_error = reason;
                    if let Some(delay) = backoff.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!("Giving up feed discovery for {}: {}", site, last_error);
        let alert = format!("Feed discovery API failed for {}: {}", site, last_error);
        if let Err(e) = self.notifier.alert_operators(&alert).await {
            warn!("Failed to alert operators: {}", e);
        }
        None
    }

    async fn call_api(&self, site: &str) -> ApiAttempt {
        let (Some(key), Some(secret)) = (&self.config.api_key, &self.config.api_secret) else {
            return ApiAttempt::GiveUp("discovery API not configured".to_string());
        };
        let endpoint = format!("{}/feeds", self.config.api_base.trim_end_matches('/'));

        let response = self
            .fetcher
            .client()
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}:{}", key, secret))
            .json(&serde_json::json!({ "url": site }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => return ApiAttempt::Retry(e.to_string()),
            Err(e) => return ApiAttempt::GiveUp(e.to_string()),
        };

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return ApiAttempt::Retry(format!("HTTP {}", status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return ApiAttempt::GiveUp(format!("HTTP {}: {}", status.as_u16(), utils::text::take_chars(&body, 200)));
        }

        match response.json::<DiscoveryApiResponse>().await {
            Ok(DiscoveryApiResponse { rss_feed_url: Some(url) }) if !url.is_empty() => ApiAttempt::Found(url),
            Ok(_) => ApiAttempt::GiveUp("response carried no feed url".to_string()),
            Err(e) => ApiAttempt::GiveUp(format!("unreadable response: {}", e)),
        }
    }

    async fn jitter(&self) {
        let (lo, hi) = (self.config.min_delay_ms, self.config.max_delay_ms.max(self.config.min_delay_ms));
        let ms = if hi > 0 { rand::rng().random_range(lo..=hi) } else { 0 };
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
