use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A place content is pulled from. Persisted as `{type, link, rss_url?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    #[serde(rename = "telegram")]
    Channel { link: String },
    Web {
        link: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rss_url: Option<String>,
    },
}

impl Source {
    pub fn link(&self) -> &str {
        match self {
            Source::Channel { link } => link,
            Source::Web { link, .. } => link,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Source::Channel { .. } => "telegram",
            Source::Web { .. } => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentLength {
    #[serde(rename = "to_100")]
    To100,
    #[serde(rename = "to_300")]
    To300,
    #[serde(rename = "to_1000")]
    To1000,
}

impl ContentLength {
    /// Upper bound on the rewritten text, in characters.
    pub fn max_chars(self) -> usize {
        match self {
            ContentLength::To100 => 100,
            ContentLength::To300 => 300,
            ContentLength::To1000 => 1000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentLength::To100 => "to_100",
            ContentLength::To300 => "to_300",
            ContentLength::To1000 => "to_1000",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "to_100" => Some(ContentLength::To100),
            "to_300" => Some(ContentLength::To300),
            "to_1000" => Some(ContentLength::To1000),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "daily")]
    Daily,
}

impl Frequency {
    pub fn interval(self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::TwelveHours => Duration::hours(12),
            Frequency::Daily => Duration::days(1),
        }
    }

    pub fn next_after(self, at: DateTime<Utc>) -> DateTime<Utc> {
        at + self.interval()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::TwelveHours => "12h",
            Frequency::Daily => "daily",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hourly" => Some(Frequency::Hourly),
            "12h" => Some(Frequency::TwelveHours),
            "daily" => Some(Frequency::Daily),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleFlags {
    pub use_emojis: bool,
    pub use_premium_emojis: bool,
    pub title_highlight: bool,
    pub cta: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// Destination channel reference (chat id or `@handle`).
    pub channel_id: String,
    pub theme: String,
    pub sources: Vec<Source>,
    pub content_length: ContentLength,
    pub style: StyleFlags,
    /// Maximum number of posts kept for this flow.
    pub volume: u32,
    pub signature: Option<String>,
    pub frequency: Frequency,
    pub custom_prompt: Option<String>,
    pub next_generation_time: Option<DateTime<Utc>>,
    pub last_generated_at: Option<DateTime<Utc>>,
}

impl Flow {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            channel_id: channel_id.into(),
            theme: String::new(),
            sources: Vec::new(),
            content_length: ContentLength::To300,
            style: StyleFlags::default(),
            volume: 10,
            signature: None,
            frequency: Frequency::Daily,
            custom_prompt: None,
            next_generation_time: None,
            last_generated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Published,
}

impl PostStatus {
    /// Draft -> Scheduled -> Published, or Draft -> Published. Never backward.
    pub fn can_transition_to(self, next: PostStatus) -> bool {
        matches!(
            (self, next),
            (PostStatus::Draft, PostStatus::Scheduled)
                | (PostStatus::Draft, PostStatus::Published)
                | (PostStatus::Scheduled, PostStatus::Published)
                | (PostStatus::Scheduled, PostStatus::Scheduled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(PostStatus::Draft),
            "scheduled" => Some(PostStatus::Scheduled),
            "published" => Some(PostStatus::Published),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
        }
    }
}

/// A stored image or video: storage-relative path or absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub path_or_url: String,
    pub order: u32,
}

impl MediaRef {
    pub fn is_remote(&self) -> bool {
        self.path_or_url.starts_with("http://") || self.path_or_url.starts_with("https://")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub content: String,
    pub original_content: String,
    pub status: PostStatus,
    pub source_id: Option<String>,
    pub source_url: Option<String>,
    pub original_link: Option<String>,
    pub original_date: Option<DateTime<Utc>>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub publication_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub images: Vec<MediaRef>,
    pub videos: Vec<MediaRef>,
}

impl Post {
    pub fn has_media(&self) -> bool {
        !self.images.is_empty() || !self.videos.is_empty()
    }
}

/// A post about to be persisted; always created as a draft.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPost {
    pub flow_id: Uuid,
    pub content: String,
    pub original_content: String,
    pub source_id: Option<String>,
    pub source_url: Option<String>,
    pub original_link: Option<String>,
    pub original_date: Option<DateTime<Utc>>,
    pub images: Vec<MediaRef>,
    pub videos: Vec<MediaRef>,
}

impl NewPost {
    pub fn into_post(self, created_at: DateTime<Utc>) -> Post {
        Post {
            id: Uuid::new_v4(),
            flow_id: self.flow_id,
            content: self.content,
            original_content: self.original_content,
            status: PostStatus::Draft,
            source_id: self.source_id,
            source_url: self.source_url,
            original_link: self.original_link,
            original_date: self.original_date,
            scheduled_time: None,
            publication_date: None,
            created_at,
            images: self.images,
            videos: self.videos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    pub generations_available: u32,
    pub channels_available: u32,
    pub sources_available: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub tariff: Option<Tariff>,
}

/// Generation counter of one tenant for the current period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantQuota {
    pub tenant_id: Uuid,
    pub generated_posts: u32,
    pub reset_at: Option<DateTime<Utc>>,
    pub tariff: Option<Tariff>,
}

impl TenantQuota {
    pub fn unlimited(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            generated_posts: 0,
            reset_at: None,
            tariff: None,
        }
    }

    /// Remaining generations this period; `None` means no tariff limit.
    pub fn remaining(&self) -> Option<u32> {
        self.tariff
            .map(|t| t.generations_available.saturating_sub(self.generated_posts))
    }

    pub fn limit(&self) -> Option<u32> {
        self.tariff.map(|t| t.generations_available)
    }

    pub fn needs_reset(&self, now: DateTime<Utc>) -> bool {
        match self.reset_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_serializes_in_persisted_shape() {
        let web = Source::Web {
            link: "https://example.com".to_string(),
            rss_url: None,
        };
        let json = serde_json::to_value(&web).unwrap();
        assert_eq!(json, serde_json::json!({"type": "web", "link": "https://example.com"}));

        let channel: Source =
            serde_json::from_value(serde_json::json!({"type": "telegram", "link": "@news"})).unwrap();
        assert_eq!(channel.link(), "@news");
        assert_eq!(channel.kind(), "telegram");
    }

    #[test]
    fn status_never_moves_backward() {
        assert!(PostStatus::Draft.can_transition_to(PostStatus::Published));
        assert!(PostStatus::Scheduled.can_transition_to(PostStatus::Published));
        assert!(!PostStatus::Published.can_transition_to(PostStatus::Draft));
        assert!(!PostStatus::Published.can_transition_to(PostStatus::Scheduled));
        assert!(!PostStatus::Scheduled.can_transition_to(PostStatus::Draft));
    }

    #[test]
    fn quota_without_tariff_is_unlimited() {
        let quota = TenantQuota::unlimited(Uuid::new_v4());
        assert_eq!(quota.remaining(), None);

        let limited = TenantQuota {
            generated_posts: 12,
            tariff: Some(Tariff {
                generations_available: 10,
                channels_available: 1,
                sources_available: 5,
            }),
            ..quota
        };
        assert_eq!(limited.remaining(), Some(0));
    }
}
