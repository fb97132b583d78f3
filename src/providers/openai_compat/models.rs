//! Chat-completions wire format. Request types borrow from the [`ChatRequest`]
//! they are built from; response types own their data.

use serde::{Deserialize, Serialize};

use crate::models::Artifact;
use crate::providers::types::{ChatMessage, ChatRequest};

#[derive(Debug, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Image generation keys its outputs on this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(request: &'a ChatRequest, stream: bool) -> Self {
        let system = request
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|prompt| WireMessage {
                role: "system",
                content: WireContent::Text(prompt),
            });

        Self {
            model: &request.model,
            messages: system
                .into_iter()
                .chain(request.messages.iter().map(WireMessage::from))
                .collect(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            user: request.correlation_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize)]
pub struct WireMessage<'a> {
    pub role: &'static str,
    pub content: WireContent<'a>,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        let content = if msg.images.is_empty() {
            WireContent::Text(&msg.content)
        } else {
            // Images first, then the text they accompany
            let parts = msg
                .images
                .iter()
                .map(|img| ContentPart::ImageUrl {
                    image_url: UrlRef { url: &img.url },
                })
                .chain(std::iter::once(ContentPart::Text { text: &msg.content }))
                .collect();
            WireContent::Parts(parts)
        };
        Self {
            role: msg.role.as_str(),
            content,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: UrlRef<'a> },
}

#[derive(Debug, Serialize)]
pub struct UrlRef<'a> {
    pub url: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct Completion {
    pub choices: Vec<Choice>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Reply,
}

/// Assistant output. Full replies and stream deltas share this shape.
#[derive(Debug, Default, Deserialize)]
pub struct Reply {
    pub content: Option<String>,
    #[serde(default)]
    pub images: Vec<GeneratedImage>,
}

impl Reply {
    pub fn artifacts(&mut self) -> Vec<Artifact> {
        self.images
            .drain(..)
            .map(|img| Artifact::image(img.image_url.url))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct GeneratedImage {
    pub image_url: GeneratedUrl,
}

#[derive(Debug, Deserialize)]
pub struct GeneratedUrl {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    pub delta: Reply,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::providers::types::ImageRef;

    #[test]
    fn test_request_puts_system_first_and_images_before_text() {
        let mut msg = ChatMessage::text(Role::User, "What is this?");
        msg.images.push(ImageRef {
            mime_type: "image/png".to_string(),
            url: "https://files.example/cat.png".to_string(),
        });
        let request = ChatRequest {
            model: "gpt-test".to_string(),
            messages: vec![msg],
            temperature: None,
            system_prompt: Some("sys".to_string()),
            max_tokens: None,
            correlation_id: Some("msg-1".to_string()),
        };
        let json = serde_json::to_value(CompletionRequest::new(&request, true)).unwrap();

        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"][0]["type"], "image_url");
        assert_eq!(
            json["messages"][1]["content"][0]["image_url"]["url"],
            "https://files.example/cat.png"
        );
        assert_eq!(json["messages"][1]["content"][1]["text"], "What is this?");
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["user"], "msg-1");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_blank_system_prompt_is_dropped() {
        let request = ChatRequest {
            model: "gpt-test".to_string(),
            messages: vec![ChatMessage::text(Role::User, "Hi")],
            temperature: Some(0.2),
            system_prompt: Some("  ".to_string()),
            max_tokens: None,
            correlation_id: None,
        };
        let json = serde_json::to_value(CompletionRequest::new(&request, false)).unwrap();
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["content"], "Hi");
        assert!(json.get("stream_options").is_none());
    }
}
