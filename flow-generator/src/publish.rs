use crate::config::PublishConfig;
use crate::media::MediaStore;
use crate::traits::{ChannelPublisher, FlowRepository, MediaLocation, OutboundMedia, PostFilter, PostRepository, StatusUpdate};
use crate::types::{GeneratorError, MediaKind, Post, PostStatus, Result};
use crate::utils::html::{split_markup, truncate_markup};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of one `publish_due` sweep.
#[derive(Debug, Default, Clone)]
pub struct DueReport {
    pub published: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

/// Sends posts to their channel exactly once and manages scheduling.
pub struct PublishCoordinator {
    posts: Arc<dyn PostRepository>,
    flows: Arc<dyn FlowRepository>,
    publisher: Arc<dyn ChannelPublisher>,
    media: Arc<MediaStore>,
    config: PublishConfig,
}

impl PublishCoordinator {
    pub fn new(
        posts: Arc<dyn PostRepository>,
        flows: Arc<dyn FlowRepository>,
        publisher: Arc<dyn ChannelPublisher>,
        media: Arc<MediaStore>,
        config: PublishConfig,
    ) -> Self {
        Self {
            posts,
            flows,
            publisher,
            media,
            config,
        }
    }

    /// Publishes a post while holding its row lock. A second concurrent call waits
    /// for the lock and then fails with `AlreadyPublished`.
    pub async fn publish(&self, post_id: Uuid, channel_id: &str) -> Result<Post> {
        let lock = self.posts.lock_post(post_id).await?;
        let post = lock.post().clone();
        if post.status == PostStatus::Published {
            return Err(GeneratorError::AlreadyPublished { id: post_id });
        }

        if let Err(e) = self.send(&post, channel_id).await {
            error!("Failed to publish post {} to {}: {}", post_id, channel_id, e);
            return Err(match e {
                GeneratorError::PublishFailed(_) => e,
                other => GeneratorError::PublishFailed(other.to_string()),
            });
        }

        let published = lock
            .commit(StatusUpdate {
                status: PostStatus::Published,
                publication_date: Some(Utc::now()),
                scheduled_time: None,
            })
            .await?;
        info!("Published post {} to {}", post_id, channel_id);
        Ok(published)
    }

    /// Moves a draft (or re-times a scheduled post) to `Scheduled` at `at`.
    pub async fn schedule(&self, post_id: Uuid, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<Post> {
        if at <= now {
            return Err(GeneratorError::PastScheduledTime { at });
        }
        let lock = self.posts.lock_post(post_id).await?;
        let current = lock.post().status;
        if current == PostStatus::Published {
            return Err(GeneratorError::AlreadyPublished { id: post_id });
        }
        if !current.can_transition_to(PostStatus::Scheduled) {
            return Err(GeneratorError::InvalidTransition {
                id: post_id,
                from: current,
                to: PostStatus::Scheduled,
            });
        }

        let scheduled = lock
            .commit(StatusUpdate {
                status: PostStatus::Scheduled,
                publication_date: None,
                scheduled_time: Some(at),
            })
            .await?;
        info!("Scheduled post {} for {}", post_id, at);
        Ok(scheduled)
    }

    /// Publishes every scheduled post whose time has come to its flow's channel.
    pub async fn publish_due(&self, now: DateTime<Utc>) -> Result<DueReport> {
        let due = self
            .posts
            .list_posts(PostFilter {
                status: Some(PostStatus::Scheduled),
                scheduled_before: Some(now),
                ..Default::default()
            })
            .await?;

        let mut report = DueReport::default();
        for post in due {
            let channel = match self.flows.get_flow(post.flow_id).await? {
                Some(flow) => flow.channel_id,
                None => {
                    warn!("Scheduled post {} belongs to missing flow {}", post.id, post.flow_id);
                    report.failed.push((post.id, "flow not found".to_string()));
                    continue;
                }
            };
            match self.publish(post.id, &channel).await {
                Ok(_) => report.published.push(post.id),
                // Another worker got there first.
                Err(GeneratorError::AlreadyPublished { .. }) => {}
                Err(e) => report.failed.push((post.id, e.to_string())),
            }
        }

        if !report.published.is_empty() || !report.failed.is_empty() {
            info!(
                "Due sweep: {} published, {} failed",
                report.published.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    async fn send(&self, post: &Post, channel_id: &str) -> Result<()> {
        if !post.has_media() {
            for chunk in split_markup(&post.content, self.config.message_limit) {
                self.publisher.send_text(channel_id, &chunk).await?;
            }
            return Ok(());
        }

        let media = self.outbound_media(post);
        let caption = truncate_markup(&post.content, self.config.caption_limit);
        for (i, group) in media.chunks(self.config.media_group_limit.max(1)).enumerate() {
            let caption = if i == 0 { caption.as_str() } else { "" };
            self.publisher.send_media_group(channel_id, group, caption).await?;
        }
        Ok(())
    }

    fn outbound_media(&self, post: &Post) -> Vec<OutboundMedia> {
        let mut images = post.images.clone();
        images.sort_by_key(|m| m.order);
        let mut videos = post.videos.clone();
        videos.sort_by_key(|m| m.order);

        images
            .into_iter()
            .map(|m| (MediaKind::Image, m))
            .chain(videos.into_iter().map(|m| (MediaKind::Video, m)))
            .map(|(kind, m)| OutboundMedia {
                kind,
                location: if m.is_remote() {
                    MediaLocation::Url(m.path_or_url)
                } else {
                    MediaLocation::File(self.media.resolve(&m.path_or_url))
                },
            })
            .collect()
    }
}
