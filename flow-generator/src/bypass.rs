use crate::config::BypassConfig;
use crate::types::{GeneratorError, Result};
use rand::seq::IndexedRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
struct SolverSolution {
    status: u16,
    #[serde(default)]
    response: String,
}

/// Second-chance page fetch for sites that refuse plain HTTP clients.
pub struct BypassFetcher {
    solver: Client,
    browser: Client,
    config: BypassConfig,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl BypassFetcher {
    pub fn new(config: BypassConfig) -> Result<Self> {
        let solver = Client::builder()
            .timeout(Duration::from_millis(config.solver_timeout_ms + 10_000))
            .build()?;
        let browser = Client::builder()
            .cookie_store(true)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            solver,
            browser,
            config,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Page HTML, or `None` when every path failed.
    pub async fn get_page_content(&self, url: &str) -> Option<String> {
        let outcome = match self.config.solver_endpoint.as_deref() {
            Some(endpoint) => self.via_solver(endpoint, url).await,
            None => self.via_browser_profile(url).await,
        };

        match outcome {
            Ok(html) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                info!("Bypass fetch succeeded for {}", url);
                Some(html)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Bypass fetch failed for {}: {}", url, e);
                None
            }
        }
    }

    /// (successes, failures) since start.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }

    async fn via_solver(&self, endpoint: &str, url: &str) -> Result<String> {
        debug!("Requesting {} through solver {}", url, endpoint);
        let body = serde_json::json!({
            "cmd": "request.get",
            "url": url,
            "maxTimeout": self.config.solver_timeout_ms,
        });
        let response: SolverResponse = self
            .solver
            .post(endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "ok" {
            return Err(GeneratorError::General(format!("solver: {}", response.message)));
        }
        match response.solution {
            Some(solution) if (200..300).contains(&solution.status) && !solution.response.is_empty() => {
                Ok(solution.response)
            }
            Some(solution) => Err(GeneratorError::General(format!(
                "solver returned HTTP {}",
                solution.status
            ))),
            None => Err(GeneratorError::General("solver returned no solution".to_string())),
        }
    }

    async fn via_browser_profile(&self, url: &str) -> Result<String> {
        let response = self
            .browser
            .get(url)
            .headers(browser_headers(url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeneratorError::General(format!("HTTP {}", status.as_u16())));
        }
        Ok(response.text().await?)
    }
}

fn browser_headers(url: &str) -> HeaderMap {
    let agent = DESKTOP_USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0]);

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(agent));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    if let Some(root) = crate::utils::url::site_root(url) {
        if let Ok(value) = HeaderValue::from_str(&format!("{}/", root)) {
            headers.insert(REFERER, value);
        }
    }
    headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));
    headers
}
