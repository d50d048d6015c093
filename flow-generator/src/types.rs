use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tempfile::TempPath;
use uuid::Uuid;

pub use interfaces::defs::{
    ContentLength, Flow, Frequency, MediaKind, MediaRef, NewPost, Post, PostStatus, Source,
    StyleFlags, Tariff, Tenant, TenantQuota,
};

/// Where a piece of media currently lives before it is stored.
#[derive(Debug)]
pub enum MediaSource {
    Remote(String),
    /// Downloaded into a temp file; the file is removed when this is dropped.
    Temp(TempPath),
    Local(PathBuf),
}

impl MediaSource {
    pub fn describe(&self) -> String {
        match self {
            MediaSource::Remote(url) => url.clone(),
            MediaSource::Temp(path) => path.display().to_string(),
            MediaSource::Local(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug)]
pub struct RawMedia {
    pub kind: MediaKind,
    pub source: MediaSource,
}

impl RawMedia {
    pub fn remote(kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            source: MediaSource::Remote(url.into()),
        }
    }
}

/// An item read from a source, not yet transformed or persisted.
#[derive(Debug)]
pub struct RawPost {
    pub text: String,
    pub media: Vec<RawMedia>,
    pub original_link: Option<String>,
    pub original_date: Option<DateTime<Utc>>,
    pub source_url: String,
    pub source_id: String,
}

#[derive(Debug)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub guid: Option<String>,
    pub url: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Images shipped by the feed itself (enclosures, media content, inline `<img>`).
    pub images: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub success: bool,
    pub error: Option<String>,
    pub fetch_time: DateTime<Utc>,
    pub response_time_ms: u64,
    pub http_status: Option<u16>,
    pub content: Option<String>,
}

impl FetchResult {
    /// The remote refused us in a way a browser-like client may get past.
    pub fn is_blocked(&self) -> bool {
        matches!(self.http_status, Some(403) | Some(429) | Some(503))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Media file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid media {path}: {reason}")]
    InvalidMedia { path: String, reason: String },

    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Media IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Flow not found: {id}")]
    FlowNotFound { id: Uuid },

    #[error("Post not found: {id}")]
    PostNotFound { id: Uuid },

    #[error("Source {link} unavailable: {reason}")]
    SourceUnavailable { link: String, reason: String },

    #[error("Content transformation failed: {0}")]
    TransformFailed(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Generation quota exceeded: {used}/{limit}")]
    QuotaExceeded { used: u32, limit: u32 },

    #[error("Flow {flow_id} has no sources")]
    NoSources { flow_id: Uuid },

    #[error("Generation already running for flow {flow_id}")]
    RunInProgress { flow_id: Uuid },

    #[error("Post {id} is already published")]
    AlreadyPublished { id: Uuid },

    #[error("Scheduled time {at} is in the past")]
    PastScheduledTime { at: DateTime<Utc> },

    #[error("Post {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: PostStatus,
        to: PostStatus,
    },

    #[error("Publishing failed: {0}")]
    PublishFailed(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Rate limited for {seconds} seconds")]
    RateLimited { seconds: u64 },

    #[error("Response size exceeds limit: {size_mb}MB")]
    ResponseTooLarge { size_mb: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, GeneratorError>;
