//! Outbound side of the chat channel: pushes text back to a conversation.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::SendRequest;
use tracing::{error, info};

use crate::remediation::Notifier;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel answered with status {0}")]
    Status(u16),
    #[error("channel request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<(), ChannelError>;
}

/// Writes outbound messages to the log. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl OutboundChannel for LogChannel {
    async fn send(&self, request: &SendRequest) -> Result<(), ChannelError> {
        info!(
            chat_id = %request.chat_id,
            files = request.files.len(),
            "outbound message: {}",
            request.text
        );
        Ok(())
    }
}

/// POSTs each `SendRequest` as JSON to a channel adapter.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl OutboundChannel for WebhookChannel {
    async fn send(&self, request: &SendRequest) -> Result<(), ChannelError> {
        let res = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| ChannelError::Request(e.to_string()))?;

        if !res.status().is_success() {
            return Err(ChannelError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}

/// Sends remediation notices to the admin conversation.
pub struct ChannelNotifier {
    channel: Arc<dyn OutboundChannel>,
    chat_id: String,
}

impl ChannelNotifier {
    pub fn new(channel: Arc<dyn OutboundChannel>, chat_id: impl Into<String>) -> Self {
        Self {
            channel,
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, text: &str) {
        let request = SendRequest {
            chat_id: self.chat_id.clone(),
            text: text.to_string(),
            files: Vec::new(),
        };
        if let Err(e) = self.channel.send(&request).await {
            error!(chat_id = %self.chat_id, "failed to deliver admin notice: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FailingChannel {
        seen: Mutex<Vec<SendRequest>>,
    }

    #[async_trait]
    impl OutboundChannel for FailingChannel {
        async fn send(&self, request: &SendRequest) -> Result<(), ChannelError> {
            self.seen.lock().unwrap().push(request.clone());
            Err(ChannelError::Status(500))
        }
    }

    #[tokio::test]
    async fn test_notifier_targets_admin_chat_and_swallows_errors() {
        let channel = Arc::new(FailingChannel {
            seen: Mutex::new(Vec::new()),
        });
        let notifier = ChannelNotifier::new(channel.clone(), "admin-42");

        notifier.notify("attempt 1/3").await;

        let seen = channel.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].chat_id, "admin-42");
        assert_eq!(seen[0].text, "attempt 1/3");
    }

    #[tokio::test]
    async fn test_log_channel_accepts_everything() {
        let request = SendRequest {
            chat_id: "c1".to_string(),
            text: "hello".to_string(),
            files: vec!["out/report.pdf".to_string()],
        };
        assert!(LogChannel.send(&request).await.is_ok());
    }
}
