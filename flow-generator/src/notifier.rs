use crate::traits::Notifier;
use crate::types::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Writes notifications to the log only. Used when no bot token is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_user(&self, chat_id: i64, message: &str) -> Result<()> {
        info!(chat_id, "user notification: {}", message);
        Ok(())
    }

    async fn alert_operators(&self, message: &str) -> Result<()> {
        warn!("operator alert: {}", message);
        Ok(())
    }

    async fn log_event(&self, message: &str) -> Result<()> {
        info!("{}", message);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    User { chat_id: i64, message: String },
    Alert(String),
    Event(String),
}

/// Keeps every notification in memory for later inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn alerts(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|n| match n {
                Notification::Alert(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn user_messages(&self, chat_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|n| match n {
                Notification::User { chat_id: id, message } if *id == chat_id => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, chat_id: i64, message: &str) -> Result<()> {
        self.sent.lock().await.push(Notification::User {
            chat_id,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn alert_operators(&self, message: &str) -> Result<()> {
        self.sent.lock().await.push(Notification::Alert(message.to_string()));
        Ok(())
    }

    async fn log_event(&self, message: &str) -> Result<()> {
        self.sent.lock().await.push(Notification::Event(message.to_string()));
        Ok(())
    }
}
