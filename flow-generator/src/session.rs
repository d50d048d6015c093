use crate::config::SessionConfig;
use crate::types::MediaKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntity {
    pub id: i64,
    pub username: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMedia {
    pub kind: MediaKind,
    /// Opaque handle understood by the session for downloads.
    pub file_ref: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub grouped_id: Option<i64>,
    #[serde(default)]
    pub media: Option<MessageMedia>,
    /// URLs of inline keyboard buttons attached to the message.
    #[serde(default)]
    pub button_urls: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("session is not authorized")]
    Unauthorized,

    #[error("flood wait: retry after {seconds}s")]
    FloodWait { seconds: u64 },

    #[error("session transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

/// An authenticated messaging account able to read channels.
#[async_trait]
pub trait ChannelSession: Send + Sync {
    async fn resolve(&self, handle: &str) -> Result<ChannelEntity, SessionError>;

    async fn join_invite(&self, token: &str) -> Result<(), SessionError>;

    /// Most recent messages, newest first.
    async fn recent_messages(&self, entity: &ChannelEntity, limit: usize) -> Result<Vec<ChannelMessage>, SessionError>;

    /// Messages with ids in `min_id..=max_id`.
    async fn messages_around(
        &self,
        entity: &ChannelEntity,
        min_id: i64,
        max_id: i64,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, SessionError>;

    /// Writes the media to `dest`, returning the number of bytes written.
    async fn download_media(&self, entity: &ChannelEntity, media: &MessageMedia, dest: &Path) -> Result<u64, SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ChannelSession>, SessionError>;
}

/// The process-wide session: opened on first use, one user at a time.
pub struct SessionHandle {
    connector: Arc<dyn SessionConnector>,
    slot: Mutex<Option<Arc<dyn ChannelSession>>>,
}

/// Exclusive use of the session until dropped.
pub struct SessionLease<'a> {
    _guard: MutexGuard<'a, Option<Arc<dyn ChannelSession>>>,
    session: Arc<dyn ChannelSession>,
}

impl Deref for SessionLease<'_> {
    type Target = dyn ChannelSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl SessionHandle {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            slot: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) -> Result<SessionLease<'_>, SessionError> {
        let mut guard = self.slot.lock().await;
        let session = match guard.as_ref() {
            Some(session) => session.clone(),
            None => {
                info!("Opening messaging session");
                let session = self.connector.connect().await?;
                *guard = Some(session.clone());
                session
            }
        };
        Ok(SessionLease {
            _guard: guard,
            session,
        })
    }

    pub async fn is_open(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    pub async fn close(&self) {
        let session = self.slot.lock().await.take();
        if let Some(session) = session {
            match session.disconnect().await {
                Ok(()) => info!("Messaging session closed"),
                Err(e) => warn!("Error while closing messaging session: {}", e),
            }
        }
    }
}

/// Talks JSON to an MTProto bridge that owns the actual user session.
pub struct GatewaySession {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SessionStatus {
    authorized: bool,
}

impl GatewaySession {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, SessionError> {
        let status = response.status();
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(SessionError::NotFound(what.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SessionError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => {
                let seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30);
                Err(SessionError::FloodWait { seconds })
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(SessionError::Transport(format!("{} returned HTTP {}: {}", what, s.as_u16(), body)))
            }
        }
    }

    async fn history(&self, entity: &ChannelEntity, query: &[(&str, String)]) -> Result<Vec<ChannelMessage>, SessionError> {
        let response = self
            .client
            .get(self.url(&format!("/channels/{}/messages", entity.id)))
            .query(query)
            .send()
            .await?;
        let response = Self::check(response, "history").await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChannelSession for GatewaySession {
    async fn resolve(&self, handle: &str) -> Result<ChannelEntity, SessionError> {
        let response = self
            .client
            .get(self.url("/resolve"))
            .query(&[("handle", handle)])
            .send()
            .await?;
        let response = Self::check(response, handle).await?;
        Ok(response.json().await?)
    }

    async fn join_invite(&self, token: &str) -> Result<(), SessionError> {
        let response = self
            .client
            .post(self.url("/join"))
            .json(&serde_json::json!({ "invite": token }))
            .send()
            .await?;
        Self::check(response, token).await?;
        Ok(())
    }

    async fn recent_messages(&self, entity: &ChannelEntity, limit: usize) -> Result<Vec<ChannelMessage>, SessionError> {
        self.history(entity, &[("limit", limit.to_string())]).await
    }

    async fn messages_around(
        &self,
        entity: &ChannelEntity,
        min_id: i64,
        max_id: i64,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, SessionError> {
        self.history(
            entity,
            &[
                ("limit", limit.to_string()),
                ("min_id", min_id.to_string()),
                ("max_id", max_id.to_string()),
            ],
        )
        .await
    }

    async fn download_media(&self, entity: &ChannelEntity, media: &MessageMedia, dest: &Path) -> Result<u64, SessionError> {
        let response = self
            .client
            .get(self.url(&format!("/channels/{}/media/{}", entity.id, media.file_ref)))
            .send()
            .await?;
        let response = Self::check(response, &media.file_ref).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!("Downloaded {} bytes of {}", written, media.file_ref);
        Ok(written)
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let response = self.client.post(self.url("/disconnect")).send().await?;
        Self::check(response, "disconnect").await?;
        Ok(())
    }
}

pub struct GatewayConnector {
    config: SessionConfig,
}

impl GatewayConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for GatewayConnector {
    async fn connect(&self) -> Result<Arc<dyn ChannelSession>, SessionError> {
        let base_url = self
            .config
            .gateway_url
            .clone()
            .ok_or_else(|| SessionError::Transport("SESSION_GATEWAY_URL is not set".to_string()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = &self.config.gateway_token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .build()?;

        let session = GatewaySession { client, base_url };
        let response = session.client.get(session.url("/session/status")).send().await?;
        let status: SessionStatus = GatewaySession::check(response, "session").await?.json().await?;
        if !status.authorized {
            return Err(SessionError::Unauthorized);
        }

        Ok(Arc::new(session))
    }
}
