#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flow_generator::config::{MediaConfig, PublishConfig, RunConfig, TransformConfig};
use flow_generator::llm_adapter::{LlmClient, MockLlmAdapter};
use flow_generator::notifier::RecordingNotifier;
use flow_generator::orchestrator::{GenerationDeps, GenerationOrchestrator};
use flow_generator::publish::PublishCoordinator;
use flow_generator::session::{
    ChannelEntity, ChannelMessage, ChannelSession, MessageMedia, SessionConnector, SessionError, SessionHandle,
};
use flow_generator::sources::ChannelSourceReader;
use flow_generator::traits::{ChannelPublisher, OutboundMedia, SourceReader};
use flow_generator::types::{
    GeneratorError, MediaKind, RawPost, Result, Source, Tariff, TenantQuota,
};
use flow_generator::{ContentTransformer, DedupGate, FlowVolumeEvictor, MediaStore, MemoryStore};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 40, 40]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

/// A channel whose history and media are fixed up front.
pub struct ScriptedSession {
    pub entity: ChannelEntity,
    /// Newest first.
    pub messages: Vec<ChannelMessage>,
    /// file_ref -> bytes; refs missing here fail to download.
    pub files: HashMap<String, Vec<u8>>,
    pub downloads: AtomicUsize,
}

impl ScriptedSession {
    pub fn new(id: i64, username: &str) -> Self {
        Self {
            entity: ChannelEntity {
                id,
                username: Some(username.to_string()),
                title: Some(format!("{} channel", username)),
            },
            messages: Vec::new(),
            files: HashMap::new(),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn with_text_messages(mut self, count: i64) -> Self {
        for i in (1..=count).rev() {
            self.messages.push(text_message(i, &format!("News item number {}", i), hours_ago(count - i + 1)));
        }
        self
    }

    pub fn push(mut self, message: ChannelMessage) -> Self {
        self.messages.push(message);
        self.messages.sort_by(|a, b| b.id.cmp(&a.id));
        self
    }

    pub fn with_file(mut self, file_ref: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(file_ref.to_string(), bytes);
        self
    }
}

pub fn text_message(id: i64, text: &str, date: DateTime<Utc>) -> ChannelMessage {
    ChannelMessage {
        id,
        date,
        text: text.to_string(),
        grouped_id: None,
        media: None,
        button_urls: Vec::new(),
    }
}

pub fn photo(file_ref: &str) -> Option<MessageMedia> {
    Some(MessageMedia {
        kind: MediaKind::Image,
        file_ref: file_ref.to_string(),
        mime_type: Some("image/jpeg".to_string()),
    })
}

#[async_trait]
impl ChannelSession for ScriptedSession {
    async fn resolve(&self, handle: &str) -> std::result::Result<ChannelEntity, SessionError> {
        if Some(handle) == self.entity.username.as_deref() {
            Ok(self.entity.clone())
        } else {
            Err(SessionError::NotFound(handle.to_string()))
        }
    }

    async fn join_invite(&self, _token: &str) -> std::result::Result<(), SessionError> {
        Ok(())
    }

    async fn recent_messages(
        &self,
        _entity: &ChannelEntity,
        limit: usize,
    ) -> std::result::Result<Vec<ChannelMessage>, SessionError> {
        Ok(self.messages.iter().take(limit).cloned().collect())
    }

    async fn messages_around(
        &self,
        _entity: &ChannelEntity,
        min_id: i64,
        max_id: i64,
        limit: usize,
    ) -> std::result::Result<Vec<ChannelMessage>, SessionError> {
        Ok(self
            .messages
            .iter()
            .filter(|m| m.id >= min_id && m.id <= max_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn download_media(
        &self,
        _entity: &ChannelEntity,
        media: &MessageMedia,
        dest: &Path,
    ) -> std::result::Result<u64, SessionError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .files
            .get(&media.file_ref)
            .ok_or_else(|| SessionError::Transport(format!("no such file {}", media.file_ref)))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn disconnect(&self) -> std::result::Result<(), SessionError> {
        Ok(())
    }
}

pub struct ScriptedConnector {
    pub session: Arc<ScriptedSession>,
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self) -> std::result::Result<Arc<dyn ChannelSession>, SessionError> {
        Ok(self.session.clone())
    }
}

/// Web source stand-in returning fixed items.
#[derive(Default)]
pub struct StaticReader {
    items: Mutex<HashMap<String, Vec<(String, Option<DateTime<Utc>>)>>>,
    failing: Mutex<Vec<String>>,
}

impl StaticReader {
    pub async fn set(&self, link: &str, items: Vec<(String, Option<DateTime<Utc>>)>) {
        self.items.lock().await.insert(link.to_string(), items);
    }

    pub async fn fail(&self, link: &str) {
        self.failing.lock().await.push(link.to_string());
    }
}

#[async_trait]
impl SourceReader for StaticReader {
    async fn read(&self, _flow_id: Uuid, source: &Source, volume: usize) -> Result<Vec<RawPost>> {
        let link = source.link().to_string();
        if self.failing.lock().await.contains(&link) {
            return Err(GeneratorError::SourceUnavailable {
                link,
                reason: "connection refused".to_string(),
            });
        }
        let items = self.items.lock().await.get(&link).cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .take(volume)
            .map(|(text, date)| RawPost {
                source_id: format!("rss_{}", text.replace(' ', "_").to_lowercase()),
                original_link: Some(format!("{}/{}", link, text.len())),
                original_date: date,
                source_url: link.clone(),
                media: Vec::new(),
                text,
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { channel: String, text: String },
    Group { channel: String, media: Vec<OutboundMedia>, caption: String },
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub sent: Mutex<Vec<Sent>>,
    pub delay_ms: u64,
    pub fail: bool,
}

impl RecordingPublisher {
    pub fn slow(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    pub fn broken() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }

    async fn record(&self, sent: Sent) -> Result<()> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail {
            return Err(GeneratorError::PublishFailed("chat not found".to_string()));
        }
        self.sent.lock().await.push(sent);
        Ok(())
    }
}

#[async_trait]
impl ChannelPublisher for RecordingPublisher {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()> {
        self.record(Sent::Text {
            channel: channel_id.to_string(),
            text: text.to_string(),
        })
        .await
    }

    async fn send_media_group(&self, channel_id: &str, media: &[OutboundMedia], caption: &str) -> Result<()> {
        self.record(Sent::Group {
            channel: channel_id.to_string(),
            media: media.to_vec(),
            caption: caption.to_string(),
        })
        .await
    }
}

pub fn limited_quota(tenant_id: Uuid, used: u32, limit: u32) -> TenantQuota {
    TenantQuota {
        tenant_id,
        generated_posts: used,
        reset_at: Some(Utc::now() + Duration::days(10)),
        tariff: Some(Tariff {
            generations_available: limit,
            channels_available: 1,
            sources_available: 10,
        }),
    }
}

pub fn fast_transform_config() -> TransformConfig {
    TransformConfig {
        batch_pause_ms: 0,
        api_error_delay_ms: 0,
        rate_limit_cap_ms: 10,
        ..Default::default()
    }
}

/// Engine pieces wired over an in-memory store and a temp media root.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub llm: Arc<MockLlmAdapter>,
    pub media: Arc<MediaStore>,
    pub web: Arc<StaticReader>,
    pub session: Arc<ScriptedSession>,
    pub orchestrator: GenerationOrchestrator,
    pub media_dir: TempDir,
}

impl Harness {
    pub fn new(session: ScriptedSession, llm: MockLlmAdapter) -> Self {
        init_tracing();
        let media_dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let llm = Arc::new(llm);
        let media = Arc::new(
            MediaStore::new(MediaConfig {
                root: media_dir.path().to_path_buf(),
                ..Default::default()
            })
            .expect("media store"),
        );
        let web = Arc::new(StaticReader::default());
        let session = Arc::new(session);

        let handle = Arc::new(SessionHandle::new(Arc::new(ScriptedConnector {
            session: session.clone(),
        })));
        let channel_reader = Arc::new(ChannelSourceReader::new(
            handle,
            store.clone(),
            Arc::new(Semaphore::new(4)),
            media.temp_dir().to_path_buf(),
        ));
        let llm_client: Arc<dyn LlmClient> = llm.clone();
        let transformer = Arc::new(ContentTransformer::new(
            llm_client,
            notifier.clone(),
            fast_transform_config(),
        ));

        let orchestrator = GenerationOrchestrator::new(
            GenerationDeps {
                flows: store.clone(),
                quota: store.clone(),
                notifier: notifier.clone(),
                channel_reader,
                web_reader: web.clone(),
                transformer,
                media: media.clone(),
                dedup: DedupGate::new(store.clone()),
                evictor: FlowVolumeEvictor::new(store.clone(), media.clone()),
            },
            RunConfig {
                source_timeout_seconds: 5,
                persist_concurrency: 4,
            },
        );

        Self {
            store,
            notifier,
            llm,
            media,
            web,
            session,
            orchestrator,
            media_dir,
        }
    }

    pub fn publisher(&self, channel: Arc<dyn ChannelPublisher>) -> PublishCoordinator {
        PublishCoordinator::new(
            self.store.clone(),
            self.store.clone(),
            channel,
            self.media.clone(),
            PublishConfig::default(),
        )
    }
}
