use crate::types::{GeneratorError, Result};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub max_response_size_mb: usize,
    pub max_redirects: usize,
    /// Minimum spacing between two requests to the same host.
    pub min_host_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (compatible; FlowGenerator/1.0)".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 1,
            max_response_size_mb: 10,
            max_redirects: 5,
            min_host_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// rss.app compatible API root.
    pub api_base: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl DiscoveryConfig {
    pub fn api_enabled(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.rss.app/v1".to_string(),
            api_key: None,
            api_secret: None,
            min_delay_ms: 1000,
            max_delay_ms: 3000,
            max_retries: 3,
            retry_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub max_images: usize,
    pub max_feed_images: usize,
    pub min_image_width: u32,
    pub min_image_height: u32,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_images: 5,
            max_feed_images: 3,
            min_image_width: 400,
            min_image_height: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BypassConfig {
    /// FlareSolverr-compatible endpoint, e.g. `http://localhost:8191/v1`.
    pub solver_endpoint: Option<String>,
    pub solver_timeout_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            solver_endpoint: None,
            solver_timeout_ms: 60_000,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 15,
            temperature: 0.5,
            top_p: 0.9,
            max_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub max_retries: u32,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub rate_limit_cap_ms: u64,
    pub api_error_delay_ms: u64,
    pub cache_capacity: usize,
}

impl TransformConfig {
    /// Retries are kept within 2..=5.
    pub fn retries(&self) -> u32 {
        self.max_retries.clamp(2, 5)
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            batch_size: 5,
            batch_pause_ms: 3000,
            rate_limit_cap_ms: 5000,
            api_error_delay_ms: 1000,
            cache_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub root: PathBuf,
    /// Reference remote images by URL instead of copying them.
    pub keep_remote_images: bool,
    pub download_timeout_seconds: u64,
    pub max_download_mb: usize,
    pub user_agent: String,
    /// Hosts (matched by suffix) that want their own site as `Referer`.
    pub referer_overrides: Vec<(String, String)>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("media"),
            keep_remote_images: true,
            download_timeout_seconds: 30,
            max_download_mb: 50,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
            referer_overrides: vec![
                ("atptour.com".to_string(), "https://www.atptour.com/".to_string()),
                ("sportarena.com".to_string(), "https://sportarena.com/".to_string()),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub timeout_seconds: u64,
    pub download_concurrency: usize,
    /// How many recent messages are read per accepted item.
    pub history_multiplier: usize,
    /// Album members are looked up within this many ids of the first message.
    pub album_window: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gateway_url: None,
            gateway_token: None,
            timeout_seconds: 60,
            download_concurrency: 10,
            history_multiplier: 3,
            album_window: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub caption_limit: usize,
    pub message_limit: usize,
    pub media_group_limit: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            caption_limit: 1024,
            message_limit: 4096,
            media_group_limit: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: Option<String>,
    pub admin_chat_ids: Vec<i64>,
    pub log_chat_id: Option<i64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: None,
            admin_chat_ids: Vec::new(),
            log_chat_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source_timeout_seconds: u64,
    pub persist_concurrency: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_timeout_seconds: 120,
            persist_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeneratorConfig {
    pub database_url: Option<String>,
    pub fetch: FetchConfig,
    pub discovery: DiscoveryConfig,
    pub scraper: ScraperConfig,
    pub bypass: BypassConfig,
    pub llm: LlmConfig,
    pub transform: TransformConfig,
    pub media: MediaConfig,
    pub session: SessionConfig,
    pub publish: PublishConfig,
    pub telegram: TelegramConfig,
    pub run: RunConfig,
}

impl GeneratorConfig {
    /// Builds the configuration from the process environment, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = GeneratorConfig {
            database_url: env_opt("DATABASE_URL"),
            ..Default::default()
        };

        if let Some(root) = env_opt("MEDIA_ROOT") {
            config.media.root = PathBuf::from(root);
        }
        if let Some(keep) = env_parse::<bool>("KEEP_REMOTE_IMAGES")? {
            config.media.keep_remote_images = keep;
        }

        config.llm.api_key = env_opt("OPENAI_API_KEY");
        if let Some(base) = env_opt("OPENAI_BASE_URL") {
            config.llm.base_url = base;
        }
        if let Some(model) = env_opt("OPENAI_MODEL") {
            config.llm.model = model;
        }
        if let Some(retries) = env_parse::<u32>("LLM_MAX_RETRIES")? {
            config.transform.max_retries = retries;
        }

        config.discovery.api_key = env_opt("RSS_APP_KEY");
        config.discovery.api_secret = env_opt("RSS_APP_SECRET");
        config.bypass.solver_endpoint = env_opt("BYPASS_ENDPOINT");

        config.session.gateway_url = env_opt("SESSION_GATEWAY_URL");
        config.session.gateway_token = env_opt("SESSION_GATEWAY_TOKEN");
        if let Some(n) = env_parse::<usize>("DOWNLOAD_CONCURRENCY")? {
            if n == 0 {
                return Err(GeneratorError::Config(
                    "DOWNLOAD_CONCURRENCY must be at least 1".to_string(),
                ));
            }
            config.session.download_concurrency = n;
        }

        config.telegram.bot_token = env_opt("TELEGRAM_BOT_TOKEN");
        if let Some(ids) = env_opt("ADMIN_CHAT_IDS") {
            config.telegram.admin_chat_ids = parse_id_list(&ids)?;
        }
        config.telegram.log_chat_id = env_parse::<i64>("LOG_CHAT_ID")?;

        if let Some(secs) = env_parse::<u64>("SOURCE_TIMEOUT_SECONDS")? {
            config.run.source_timeout_seconds = secs;
        }

        Ok(config)
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| GeneratorError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| GeneratorError::Config(format!("bad chat id {:?}: {}", s, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_admin_ids() {
        assert_eq!(parse_id_list("1, -1002, 3,").unwrap(), vec![1, -1002, 3]);
        assert!(parse_id_list("1,abc").is_err());
    }

    #[test]
    fn retries_are_clamped() {
        let mut config = TransformConfig::default();
        config.max_retries = 9;
        assert_eq!(config.retries(), 5);
        config.max_retries = 0;
        assert_eq!(config.retries(), 2);
    }
}
