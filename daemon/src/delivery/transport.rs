use std::time::Duration;

use async_trait::async_trait;
use shared_types::{CoreReply, IncomingMessage, MessageEnvelope};

use crate::health::HealthProbe;

/// Any of these is a delivery failure; the pipeline does not tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("core answered with status {0}")]
    Status(u16),
    #[error("core request timed out")]
    Timeout,
    #[error("core request failed: {0}")]
    Request(String),
    #[error("core reply could not be decoded: {0}")]
    Decode(String),
}

/// Local RPC to the core worker.
#[async_trait]
pub trait CoreTransport: Send + Sync {
    async fn deliver(&self, message: &IncomingMessage) -> Result<CoreReply, TransportError>;

    async fn health(&self) -> bool;
}

/// `POST /message` over HTTP with a per-request deadline.
pub struct HttpCoreTransport {
    client: reqwest::Client,
    message_url: String,
    request_timeout: Duration,
    probe: HealthProbe,
}

impl HttpCoreTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        request_timeout: Duration,
        health_timeout: Duration,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/');
        Self {
            probe: HealthProbe::new(client.clone(), base_url, health_timeout),
            message_url: format!("{base_url}/message"),
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl CoreTransport for HttpCoreTransport {
    async fn deliver(&self, message: &IncomingMessage) -> Result<CoreReply, TransportError> {
        let res = self
            .client
            .post(&self.message_url)
            .timeout(self.request_timeout)
            .json(&MessageEnvelope {
                message: message.clone(),
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        res.json::<CoreReply>().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Decode(e.to_string())
            }
        })
    }

    async fn health(&self) -> bool {
        self.probe.is_healthy().await
    }
}
