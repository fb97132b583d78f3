use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Artifact, Role};

/// Provider failures, classified so the pipeline can report them uniformly.
/// Every variant leads to a refund of the turn's reservation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Provider timed out: {0}")]
    Timeout(String),

    #[error("Provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Classify a non-success HTTP status returned by a provider.
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            400 | 401 | 403 | 404 | 413 | 422 => ProviderError::Rejected(message),
            408 | 504 => ProviderError::Timeout(message),
            429 | 500..=599 => ProviderError::Unavailable(message),
            _ => ProviderError::Unknown(message),
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ProviderError::Unavailable(err.to_string())
        } else {
            ProviderError::Unknown(err.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Unavailable(_) => "provider_unavailable",
            ProviderError::Rejected(_) => "provider_rejected",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Unknown(_) => "unknown",
        }
    }
}

// --- Chat types ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub mime_type: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    /// Correlates provider-side artifact generation with the assistant message.
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Artifact(Artifact),
    Done {
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
    },
    Error(ProviderError),
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub artifacts: Vec<Artifact>,
}
