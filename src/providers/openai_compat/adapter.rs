use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::{ApiError, Completion, CompletionRequest};
use super::stream::relay_chunks;
use crate::providers::traits::AiProvider;
use crate::providers::types::{ChatRequest, ChatResponse, ProviderError, StreamEvent};

/// Any server speaking the OpenAI chat-completions protocol.
pub struct OpenAiCompatProvider {
    id: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    /// An empty `api_key` sends no authorization header, as local servers expect.
    pub fn new(id: &str, base_url: &str, api_key: String) -> Self {
        Self {
            id: id.to_string(),
            client: Client::new(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: Some(api_key).filter(|k| !k.is_empty()),
        }
    }

    async fn post(&self, body: &CompletionRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let mut req = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| "Request failed".to_string());
        Err(ProviderError::from_status(
            status,
            format!("HTTP {}: {}", status.as_u16(), detail),
        ))
    }
}

#[async_trait]
impl AiProvider for OpenAiCompatProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let response = self.post(&CompletionRequest::new(&request, false)).await?;
        let completion: Completion = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("Invalid response: {}", e)))?;

        let mut reply = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .unwrap_or_default();
        let artifacts = reply.artifacts();
        let content = reply.content.unwrap_or_default();
        // An image-only reply is still an answer
        if content.is_empty() && artifacts.is_empty() {
            return Err(ProviderError::Unknown("No content in response".to_string()));
        }

        Ok(ChatResponse {
            content,
            model: completion.model.unwrap_or(request.model),
            tokens_in: completion.usage.and_then(|u| u.prompt_tokens),
            tokens_out: completion.usage.and_then(|u| u.completion_tokens),
            artifacts,
        })
    }

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let response = self.post(&CompletionRequest::new(&request, true)).await?;
        relay_chunks(response, tx).await;
        Ok(())
    }
}
