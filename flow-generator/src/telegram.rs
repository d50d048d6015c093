use crate::config::TelegramConfig;
use crate::traits::{ChannelPublisher, MediaLocation, Notifier, OutboundMedia};
use crate::types::{GeneratorError, MediaKind, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    description: Option<String>,
    parameters: Option<BotResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct BotResponseParameters {
    retry_after: Option<u64>,
}

/// Thin client over the Telegram Bot HTTP API.
pub struct BotApi {
    client: Client,
    base: String,
}

impl BotApi {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .ok_or_else(|| GeneratorError::Config("TELEGRAM_BOT_TOKEN is not set".to_string()))?;
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            base: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
        })
    }

    async fn call_json(&self, method: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/{}", self.base, method))
            .json(body)
            .send()
            .await?;
        Self::check(method, response).await
    }

    async fn call_multipart(&self, method: &str, form: Form) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/{}", self.base, method))
            .multipart(form)
            .send()
            .await?;
        Self::check(method, response).await
    }

    async fn check(method: &str, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        let body: BotResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return Err(GeneratorError::PublishFailed(format!(
                    "{} returned HTTP {} with unreadable body: {}",
                    method,
                    status.as_u16(),
                    e
                )))
            }
        };
        if body.ok {
            debug!("{} ok", method);
            return Ok(());
        }
        if let Some(seconds) = body.parameters.and_then(|p| p.retry_after) {
            return Err(GeneratorError::RateLimited { seconds });
        }
        Err(GeneratorError::PublishFailed(format!(
            "{}: {}",
            method,
            body.description.unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
        )))
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        self.call_json(
            "sendMessage",
            &json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }),
        )
        .await
    }
}

fn media_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "photo",
        MediaKind::Video => "video",
    }
}

async fn file_part(path: &std::path::Path) -> Result<Part> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("media")
        .to_string();
    Ok(Part::bytes(bytes).file_name(name))
}

/// Publishes posts to Telegram channels through the bot.
pub struct TelegramPublisher {
    api: Arc<BotApi>,
}

impl TelegramPublisher {
    pub fn new(api: Arc<BotApi>) -> Self {
        Self { api }
    }

    async fn send_single(&self, channel_id: &str, item: &OutboundMedia, caption: &str) -> Result<()> {
        let (method, field) = match item.kind {
            MediaKind::Image => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
        };
        match &item.location {
            MediaLocation::Url(url) => {
                let mut body = json!({
                    "chat_id": channel_id,
                    "caption": caption,
                    "parse_mode": "HTML",
                });
                body[field] = json!(url);
                self.api.call_json(method, &body).await
            }
            MediaLocation::File(path) => {
                let form = Form::new()
                    .text("chat_id", channel_id.to_string())
                    .text("caption", caption.to_string())
                    .text("parse_mode", "HTML")
                    .part(field, file_part(path).await?);
                self.api.call_multipart(method, form).await
            }
        }
    }
}

#[async_trait]
impl ChannelPublisher for TelegramPublisher {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()> {
        self.api.send_message(channel_id, text).await
    }

    async fn send_media_group(&self, channel_id: &str, media: &[OutboundMedia], caption: &str) -> Result<()> {
        match media {
            [] => return self.send_text(channel_id, caption).await,
            [single] => return self.send_single(channel_id, single, caption).await,
            _ => {}
        }

        let mut form = Form::new().text("chat_id", channel_id.to_string());
        let mut items = Vec::with_capacity(media.len());
        for (index, item) in media.iter().enumerate() {
            let reference = match &item.location {
                MediaLocation::Url(url) => url.clone(),
                MediaLocation::File(path) => {
                    let name = format!("file{}", index);
                    form = form.part(name.clone(), file_part(path).await?);
                    format!("attach://{}", name)
                }
            };
            let mut entry = json!({ "type": media_type(item.kind), "media": reference });
            if index == 0 && !caption.is_empty() {
                entry["caption"] = json!(caption);
                entry["parse_mode"] = json!("HTML");
            }
            items.push(entry);
        }
        form = form.text("media", Value::Array(items).to_string());
        self.api.call_multipart("sendMediaGroup", form).await
    }
}

/// Routes notifications to users, admins and the log chat through the bot.
pub struct TelegramNotifier {
    api: Arc<BotApi>,
    admin_chat_ids: Vec<i64>,
    log_chat_id: Option<i64>,
}

impl TelegramNotifier {
    pub fn new(api: Arc<BotApi>, config: &TelegramConfig) -> Self {
        Self {
            api,
            admin_chat_ids: config.admin_chat_ids.clone(),
            log_chat_id: config.log_chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_user(&self, chat_id: i64, message: &str) -> Result<()> {
        self.api.send_message(&chat_id.to_string(), message).await
    }

    async fn alert_operators(&self, message: &str) -> Result<()> {
        if self.admin_chat_ids.is_empty() {
            warn!("operator alert (no admins configured): {}", message);
            return Ok(());
        }
        for admin in &self.admin_chat_ids {
            if let Err(e) = self.api.send_message(&admin.to_string(), message).await {
                warn!("Failed to alert admin {}: {}", admin, e);
            }
        }
        Ok(())
    }

    async fn log_event(&self, message: &str) -> Result<()> {
        match self.log_chat_id {
            Some(chat) => self.api.send_message(&chat.to_string(), message).await,
            None => {
                debug!("{}", message);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_api_requires_token() {
        assert!(matches!(
            BotApi::new(&TelegramConfig::default()),
            Err(GeneratorError::Config(_))
        ));
    }

    #[test]
    fn bot_api_builds_method_base() {
        let config = TelegramConfig {
            bot_token: Some("123:abc".to_string()),
            ..Default::default()
        };
        let api = BotApi::new(&config).unwrap();
        assert_eq!(api.base, "https://api.telegram.org/bot123:abc");
    }

    #[test]
    fn bot_error_body_parses() {
        let body: BotResponse = serde_json::from_str(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":7}}"#,
        )
        .unwrap();
        assert!(!body.ok);
        assert_eq!(body.parameters.and_then(|p| p.retry_after), Some(7));
    }
}
