use crate::types::{Flow, NewPost, Post, PostStatus, RawPost, Result, Source, TenantQuota};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use uuid::Uuid;

/// Held for the duration of one generation run of a flow. Dropping it releases the lock.
pub struct RunLock {
    _release: Box<dyn Send>,
}

impl RunLock {
    pub fn new<T: Send + 'static>(release: T) -> Self {
        Self {
            _release: Box::new(release),
        }
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RunLock")
    }
}

/// Read access to flows plus the few fields a run may write back.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>>;

    /// Stores (or clears) the discovered feed URL on the flow's web source with this link.
    async fn set_source_feed_url(&self, flow_id: Uuid, link: &str, rss_url: Option<&str>) -> Result<()>;

    async fn update_generation_times(
        &self,
        flow_id: Uuid,
        next_generation_time: DateTime<Utc>,
        last_generated_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Returns `None` when another run already holds the lock.
    async fn try_lock_flow_run(&self, flow_id: Uuid) -> Result<Option<RunLock>>;
}

#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub flow_id: Option<Uuid>,
    pub status: Option<PostStatus>,
    pub scheduled_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn post_exists(&self, source_id: &str) -> Result<bool>;

    /// Inserts a draft. `None` when the natural key is already taken.
    async fn insert_post(&self, post: NewPost) -> Result<Option<Post>>;

    async fn get_post(&self, id: Uuid) -> Result<Option<Post>>;

    async fn list_posts(&self, filter: PostFilter) -> Result<Vec<Post>>;

    async fn count_flow_posts(&self, flow_id: Uuid) -> Result<u64>;

    /// Deletes the `count` oldest posts of a flow in one statement and returns them.
    async fn delete_oldest(&self, flow_id: Uuid, count: u64) -> Result<Vec<Post>>;

    /// Latest original date among posts whose natural key starts with `prefix`.
    async fn latest_original_date(&self, prefix: &str) -> Result<Option<DateTime<Utc>>>;

    /// Locks a post row exclusively until the returned guard is committed or dropped.
    async fn lock_post(&self, id: Uuid) -> Result<Box<dyn PostLock>>;

    async fn delete_post(&self, id: Uuid) -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate {
    pub status: PostStatus,
    pub publication_date: Option<DateTime<Utc>>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

/// Exclusive hold on one post. Dropping without `commit` leaves the post unchanged.
#[async_trait]
pub trait PostLock: Send {
    fn post(&self) -> &Post;

    async fn commit(self: Box<Self>, update: StatusUpdate) -> Result<Post>;
}

#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Current counter for the tenant, resetting it first when the period has rolled over.
    async fn tenant_quota(&self, tenant_id: Uuid) -> Result<TenantQuota>;

    async fn increment_generated(&self, tenant_id: Uuid, count: u32) -> Result<TenantQuota>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Message to the end user who triggered a run.
    async fn notify_user(&self, chat_id: i64, message: &str) -> Result<()>;

    /// Something needs an operator's attention.
    async fn alert_operators(&self, message: &str) -> Result<()>;

    /// Informational event for the operator log channel.
    async fn log_event(&self, message: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaLocation {
    Url(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMedia {
    pub kind: crate::types::MediaKind,
    pub location: MediaLocation,
}

/// Destination a post is pushed to.
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()>;

    /// The caption goes on the first item.
    async fn send_media_group(&self, channel_id: &str, media: &[OutboundMedia], caption: &str) -> Result<()>;
}

/// Pulls up to `volume` new items from one kind of source.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(&self, flow_id: Uuid, source: &Source, volume: usize) -> Result<Vec<RawPost>>;
}
