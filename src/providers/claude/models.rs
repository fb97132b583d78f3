//! Anthropic Messages API wire format.

use serde::{Deserialize, Serialize};

use crate::providers::types::{ChatMessage, ChatRequest, ProviderError};

const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Serialize)]
pub struct MessagesRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub messages: Vec<Turn<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata<'a>>,
}

impl<'a> MessagesRequest<'a> {
    pub fn new(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: request.messages.iter().map(Turn::from).collect(),
            system: request
                .system_prompt
                .as_deref()
                .filter(|p| !p.trim().is_empty()),
            temperature: request.temperature,
            stream,
            metadata: request
                .correlation_id
                .as_deref()
                .map(|user_id| Metadata { user_id }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Metadata<'a> {
    pub user_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct Turn<'a> {
    pub role: &'static str,
    pub content: TurnContent<'a>,
}

impl<'a> From<&'a ChatMessage> for Turn<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        let content = if msg.images.is_empty() {
            TurnContent::Text(&msg.content)
        } else {
            let blocks = msg
                .images
                .iter()
                .map(|img| Block::Image {
                    source: ImageSource {
                        kind: "url",
                        url: &img.url,
                    },
                })
                .chain(std::iter::once(Block::Text { text: &msg.content }))
                .collect();
            TurnContent::Blocks(blocks)
        };
        Self {
            role: msg.role.as_str(),
            content,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TurnContent<'a> {
    Text(&'a str),
    Blocks(Vec<Block<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block<'a> {
    Text { text: &'a str },
    Image { source: ImageSource<'a> },
}

#[derive(Debug, Serialize)]
pub struct ImageSource<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub url: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    pub content: Vec<ReplyBlock>,
    pub model: String,
    pub usage: Option<Usage>,
}

impl MessagesResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ReplyBlock::Text { text } => Some(text.as_str()),
                ReplyBlock::Other => None,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub message: String,
}

impl ApiError {
    /// Classify an error reported inside an otherwise successful stream.
    pub fn into_provider_error(self) -> ProviderError {
        match self.kind.as_str() {
            "overloaded_error" | "api_error" => ProviderError::Unavailable(self.message),
            "invalid_request_error" | "permission_error" => ProviderError::Rejected(self.message),
            _ => ProviderError::Unknown(self.message),
        }
    }
}

/// `data:` payloads of the streaming API, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    MessageStart { message: StartedMessage },
    ContentBlockDelta { delta: Delta },
    MessageDelta { usage: Option<Usage> },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct StartedMessage {
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}
