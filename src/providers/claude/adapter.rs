use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;

use super::models::{ErrorEnvelope, MessagesRequest, MessagesResponse};
use super::stream::relay_events;
use crate::providers::traits::AiProvider;
use crate::providers::types::{ChatRequest, ChatResponse, ProviderError, StreamEvent};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeProvider {
    id: String,
    client: Client,
    endpoint: String,
    api_key: String,
}

impl ClaudeProvider {
    pub fn new(id: &str, base_url: &str, api_key: String) -> Self {
        Self {
            id: id.to_string(),
            client: Client::new(),
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
            api_key,
        }
    }

    fn classify(status: StatusCode, body: &str) -> ProviderError {
        let detail = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| "Request failed".to_string());
        let message = format!("HTTP {}: {}", status.as_u16(), detail);
        // 529 is Anthropic's overload status
        if status.as_u16() == 529 {
            return ProviderError::Unavailable(message);
        }
        ProviderError::from_status(status, message)
    }

    async fn post(&self, body: &MessagesRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, &body))
    }
}

#[async_trait]
impl AiProvider for ClaudeProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let response = self.post(&MessagesRequest::new(&request, false)).await?;
        let reply: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("Invalid response: {}", e)))?;

        let content = reply.text();
        if content.is_empty() {
            return Err(ProviderError::Unknown("No content in response".to_string()));
        }
        let usage = reply.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: reply.model,
            tokens_in: usage.input_tokens,
            tokens_out: usage.output_tokens,
            artifacts: Vec::new(),
        })
    }

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let response = self.post(&MessagesRequest::new(&request, true)).await?;
        relay_events(response, tx).await;
        Ok(())
    }
}
