//! Shared types between the daemon and the core worker
//!
//! These types are used by both:
//! - the daemon's delivery pipeline and push endpoint
//! - the core worker's message handler
//!
//! Serializable with serde for JSON over local HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Inbound messages (Daemon → Core)
// ============================================================================

/// A chat message received by the channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Channel-assigned message id
    pub id: String,

    /// Conversation the reply belongs to
    pub chat_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub text: String,

    /// Paths of attachments already stored by the channel adapter
    #[serde(default)]
    pub attachments: Vec<String>,

    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(id: impl Into<String>, chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            user_id: None,
            text: text.into(),
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }
}

/// Body of `POST /message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message: IncomingMessage,
}

/// Successful answer from the core (or from the fallback path).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreReply {
    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl CoreReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
        }
    }
}

// ============================================================================
// Push channel (Core → Daemon)
// ============================================================================

/// Body of `POST /send`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub chat_id: String,
    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendResponse {
    pub ok: bool,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl HealthResponse {
    pub fn ok(role: &str) -> Self {
        Self {
            status: "ok".to_string(),
            role: Some(role.to_string()),
        }
    }
}
