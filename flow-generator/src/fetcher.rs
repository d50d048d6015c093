use crate::config::FetchConfig;
use crate::types::{FetchResult, GeneratorError, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

/// HTTP GET with per-host spacing and retry on transient failures.
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<RwLock<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Fetches a page, retrying 5xx, 429 and network errors with exponential backoff.
    /// Failures are reported in the result, not as errors.
    pub async fn fetch(&self, url: &str) -> Result<FetchResult> {
        self.fetch_with_retries(url, self.config.max_retries).await
    }

    /// Single attempt, used when probing many candidate URLs.
    pub async fn probe(&self, url: &str) -> Result<FetchResult> {
        self.fetch_with_retries(url, 0).await
    }

    async fn fetch_with_retries(&self, url: &str, max_retries: u32) -> Result<FetchResult> {
        let start_time = Instant::now();
        let fetch_time = Utc::now();

        debug!("Fetching: {}", url);

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 32),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds * 60)),
            ..Default::default()
        };

        let mut last_error = None;
        let mut last_status = None;

        for attempt in 0..=max_retries {
            self.apply_rate_limit(url).await?;

            match self.send(url).await {
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status.as_u16());

                    if !status.is_success() {
                        last_error = Some(format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("Unknown")
                        ));

                        if is_transient(status) && attempt < max_retries {
                            if let Some(delay) = backoff.next_backoff() {
                                warn!("Attempt {} failed for {} ({}), retrying in {:?}", attempt + 1, url, status, delay);
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                        }
                        break;
                    }

                    if let Some(content_length) = response.content_length() {
                        let size_mb = content_length as usize / (1024 * 1024);
                        if size_mb > self.config.max_response_size_mb {
                            return Err(GeneratorError::ResponseTooLarge { size_mb });
                        }
                    }

                    match response.text().await {
                        Ok(content) => {
                            info!("Fetched {} ({} bytes)", url, content.len());
                            return Ok(FetchResult {
                                url: url.to_string(),
                                success: true,
                                error: None,
                                fetch_time,
                                response_time_ms: start_time.elapsed().as_millis() as u64,
                                http_status: Some(status.as_u16()),
                                content: Some(content),
                            });
                        }
                        Err(e) => {
                            last_error = Some(e.to_string());
                        }
                    }
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    last_status = None;

                    if attempt < max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
            }
        }

        let error_msg = last_error.unwrap_or_else(|| "Unknown error".to_string());
        if max_retries > 0 {
            error!("Failed to fetch {} after {} attempts: {}", url, max_retries + 1, error_msg);
        } else {
            debug!("Probe of {} failed: {}", url, error_msg);
        }

        Ok(FetchResult {
            url: url.to_string(),
            success: false,
            error: Some(error_msg),
            fetch_time,
            response_time_ms: start_time.elapsed().as_millis() as u64,
            http_status: last_status,
            content: None,
        })
    }

    async fn send(&self, url: &str) -> Result<Response> {
        let response = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,application/rss+xml,*/*;q=0.8")
            .send()
            .await?;
        Ok(response)
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<()> {
        let parsed_url = Url::parse(url)?;
        let host = parsed_url.host_str().unwrap_or("").to_string();
        let min_interval = Duration::from_millis(self.config.min_host_interval_ms);

        // Reserve the next slot for this host, then sleep outside the lock.
        let wait_time = {
            let mut rate_limiter = self.rate_limiter.write().await;
            let now = Instant::now();
            let slot = match rate_limiter.get(&host) {
                Some(last) if *last + min_interval > now => *last + min_interval,
                _ => now,
            };
            rate_limiter.insert(host.clone(), slot);
            slot.saturating_duration_since(now)
        };

        if !wait_time.is_zero() {
            debug!("Rate limiting {}: waiting {:?}", host, wait_time);
            tokio::time::sleep(wait_time).await;
        }

        Ok(())
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}
