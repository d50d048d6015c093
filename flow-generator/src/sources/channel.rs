use crate::session::{ChannelEntity, ChannelMessage, ChannelSession, MessageMedia, SessionError, SessionHandle};
use crate::traits::{PostRepository, SourceReader};
use crate::types::{GeneratorError, MediaKind, MediaSource, RawMedia, RawPost, Result, Source};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLink {
    Handle(String),
    Invite(String),
}

/// Accepts `https://t.me/name`, `t.me/+TOKEN`, `t.me/joinchat/TOKEN`, `@name` and `name`.
pub fn parse_channel_link(link: &str) -> Option<ChannelLink> {
    let mut rest = link.trim();
    for prefix in ["https://", "http://"] {
        rest = rest.strip_prefix(prefix).unwrap_or(rest);
    }
    rest = rest.strip_prefix("www.").unwrap_or(rest);
    for host in ["t.me/", "telegram.me/", "telegram.dog/"] {
        rest = rest.strip_prefix(host).unwrap_or(rest);
    }
    rest = rest.strip_prefix("s/").unwrap_or(rest);
    let rest = rest.trim_start_matches('@');

    let first = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if let Some(token) = first.strip_prefix('+') {
        return (!token.is_empty()).then(|| ChannelLink::Invite(token.to_string()));
    }
    if first == "joinchat" {
        let token = rest
            .trim_start_matches("joinchat/")
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        return (!token.is_empty()).then(|| ChannelLink::Invite(token.to_string()));
    }
    (!first.is_empty()).then(|| ChannelLink::Handle(first.to_string()))
}

/// A button linking to another channel marks the message as cross-promotion.
pub fn is_cross_promotion(message: &ChannelMessage, entity: &ChannelEntity) -> bool {
    let own = entity.username.as_deref().unwrap_or_default().to_lowercase();
    message.button_urls.iter().any(|url| {
        let Some(path) = url.strip_prefix("https://t.me/") else {
            return false;
        };
        let target = path
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        !target.is_empty() && target != own
    })
}

pub fn message_key(chat_id: i64, message_id: i64) -> String {
    format!("channel_{}_{}", chat_id, message_id)
}

pub fn album_key(chat_id: i64, group_id: i64) -> String {
    format!("channel_{}_album_{}", chat_id, group_id)
}

/// Reads recent posts of a channel through the shared messaging session.
pub struct ChannelSourceReader {
    session: Arc<SessionHandle>,
    posts: Arc<dyn PostRepository>,
    downloads: Arc<Semaphore>,
    temp_dir: PathBuf,
    history_multiplier: usize,
    album_window: i64,
}

impl ChannelSourceReader {
    pub fn new(
        session: Arc<SessionHandle>,
        posts: Arc<dyn PostRepository>,
        downloads: Arc<Semaphore>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            session,
            posts,
            downloads,
            temp_dir,
            history_multiplier: 3,
            album_window: 10,
        }
    }

    pub fn with_window(mut self, history_multiplier: usize, album_window: i64) -> Self {
        self.history_multiplier = history_multiplier.max(1);
        self.album_window = album_window.max(1);
        self
    }

    pub async fn read(&self, link: &str, volume: usize) -> Result<Vec<RawPost>> {
        if volume == 0 {
            return Ok(Vec::new());
        }
        let unavailable = |e: SessionError| GeneratorError::SourceUnavailable {
            link: link.to_string(),
            reason: e.to_string(),
        };

        let session = self.session.acquire().await.map_err(unavailable)?;
        let entity = self.resolve_entity(&*session, link).await?;
        let watermark = self
            .posts
            .latest_original_date(&format!("channel_{}_", entity.id))
            .await?;

        let messages = session
            .recent_messages(&entity, volume * self.history_multiplier)
            .await
            .map_err(unavailable)?;
        debug!("Read {} messages from {} (watermark {:?})", messages.len(), link, watermark);

        let mut grouped_albums = HashSet::new();
        let mut items = Vec::new();

        for message in &messages {
            if items.len() >= volume {
                break;
            }
            if is_cross_promotion(message, &entity) {
                debug!("Skipping cross-promotion message {} in {}", message.id, link);
                continue;
            }
            if watermark.is_some_and(|w| message.date <= w) {
                continue;
            }

            let (key, members) = match message.grouped_id {
                Some(group_id) => {
                    if !grouped_albums.insert(group_id) {
                        continue;
                    }
                    let key = album_key(entity.id, group_id);
                    if self.posts.post_exists(&key).await? {
                        continue;
                    }
                    let members = self
                        .album_members(&*session, &entity, message, group_id, &messages)
                        .await;
                    (key, members)
                }
                None => {
                    let key = message_key(entity.id, message.id);
                    if self.posts.post_exists(&key).await? {
                        continue;
                    }
                    (key, vec![message.clone()])
                }
            };

            let text = members
                .iter()
                .map(|m| m.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            let media_refs: Vec<MessageMedia> = members.iter().filter_map(|m| m.media.clone()).collect();
            let media = self.download_all(&*session, &entity, &media_refs).await;

            if text.is_empty() && media.is_empty() {
                debug!("Dropping {} from {}: no text and no media", key, link);
                continue;
            }

            items.push(RawPost {
                text,
                media,
                original_link: Some(format!("https://t.me/c/{}/{}", entity.id, message.id)),
                original_date: Some(message.date),
                source_url: link.to_string(),
                source_id: key,
            });
        }

        info!("Channel {} yielded {} items (asked {})", link, items.len(), volume);
        Ok(items)
    }

    async fn resolve_entity(&self, session: &dyn ChannelSession, link: &str) -> Result<ChannelEntity> {
        let unavailable = |reason: String| GeneratorError::SourceUnavailable {
            link: link.to_string(),
            reason,
        };
        let parsed = parse_channel_link(link).ok_or_else(|| unavailable("unrecognised channel link".to_string()))?;

        match parsed {
            ChannelLink::Handle(handle) => session.resolve(&handle).await.map_err(|e| unavailable(e.to_string())),
            ChannelLink::Invite(token) => match session.resolve(link).await {
                Ok(entity) => Ok(entity),
                Err(first) => {
                    debug!("Resolving {} failed ({}), joining via invite", link, first);
                    session
                        .join_invite(&token)
                        .await
                        .map_err(|e| unavailable(format!("join failed: {}", e)))?;
                    session.resolve(link).await.map_err(|e| unavailable(e.to_string()))
                }
            },
        }
    }

    async fn album_members(
        &self,
        session: &dyn ChannelSession,
        entity: &ChannelEntity,
        message: &ChannelMessage,
        group_id: i64,
        batch: &[ChannelMessage],
    ) -> Vec<ChannelMessage> {
        let window = self.album_window;
        let fetched = session
            .messages_around(entity, message.id - window, message.id + window, (window * 2) as usize)
            .await;

        let mut members: Vec<ChannelMessage> = match fetched {
            Ok(around) => around.into_iter().filter(|m| m.grouped_id == Some(group_id)).collect(),
            Err(e) => {
                warn!("Album lookup for group {} failed: {}", group_id, e);
                Vec::new()
            }
        };
        if members.is_empty() {
            members = batch
                .iter()
                .filter(|m| m.grouped_id == Some(group_id))
                .cloned()
                .collect();
        }
        members.sort_by_key(|m| m.id);
        members.dedup_by_key(|m| m.id);
        members
    }

    /// Downloads in parallel under the shared semaphore; failed items are dropped.
    async fn download_all(&self, session: &dyn ChannelSession, entity: &ChannelEntity, media: &[MessageMedia]) -> Vec<RawMedia> {
        let downloads = media.iter().map(|item| async move {
            let _permit = self.downloads.acquire().await.ok()?;
            let suffix = match item.kind {
                MediaKind::Image => ".jpg",
                MediaKind::Video => ".mp4",
            };
            let temp = match tempfile::Builder::new()
                .prefix("channel-")
                .suffix(suffix)
                .tempfile_in(&self.temp_dir)
            {
                Ok(file) => file.into_temp_path(),
                Err(e) => {
                    warn!("Cannot create temp file in {}: {}", self.temp_dir.display(), e);
                    return None;
                }
            };

            match session.download_media(entity, item, &temp).await {
                Ok(0) => {
                    warn!("Empty download for {}", item.file_ref);
                    None
                }
                Ok(_) => Some(RawMedia {
                    kind: item.kind,
                    source: MediaSource::Temp(temp),
                }),
                Err(e) => {
                    warn!("Download of {} failed: {}", item.file_ref, e);
                    None
                }
            }
        });

        join_all(downloads).await.into_iter().flatten().collect()
    }
}

#[async_trait]
impl SourceReader for ChannelSourceReader {
    async fn read(&self, _flow_id: Uuid, source: &Source, volume: usize) -> Result<Vec<RawPost>> {
        match source {
            Source::Channel { link } => ChannelSourceReader::read(self, link, volume).await,
            other => Err(GeneratorError::SourceUnavailable {
                link: other.link().to_string(),
                reason: "not a channel source".to_string(),
            }),
        }
    }
}
