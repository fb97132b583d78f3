use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::claude::ClaudeProvider;
use super::openai_compat::OpenAiCompatProvider;
use super::traits::AiProvider;
use super::types::{ChatRequest, ChatResponse, ProviderError, StreamEvent};
use crate::config::{ProviderConfig, ProviderKind};

#[derive(Default)]
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn AiProvider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn from_config(entries: &[ProviderConfig]) -> Self {
        let mut router = Self::new();
        for entry in entries {
            let api_key = entry
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .unwrap_or_default();
            let provider: Arc<dyn AiProvider> = match entry.kind {
                ProviderKind::OpenAiCompatible => Arc::new(OpenAiCompatProvider::new(
                    &entry.id,
                    &entry.base_url,
                    api_key,
                )),
                ProviderKind::Claude => {
                    Arc::new(ClaudeProvider::new(&entry.id, &entry.base_url, api_key))
                }
            };
            tracing::info!(provider = %entry.id, kind = ?entry.kind, "Registered provider");
            router.register(provider);
        }
        router
    }

    pub fn register(&mut self, provider: Arc<dyn AiProvider>) {
        self.providers
            .insert(provider.provider_id().to_string(), provider);
    }

    fn get(&self, provider_id: &str) -> Result<&Arc<dyn AiProvider>, ProviderError> {
        self.providers.get(provider_id).ok_or_else(|| {
            ProviderError::Unavailable(format!("Unknown provider: {}", provider_id))
        })
    }

    pub async fn send_message(
        &self,
        provider_id: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        self.get(provider_id)?.send_message(request).await
    }

    pub async fn stream_message(
        &self,
        provider_id: &str,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.get(provider_id)?.stream_message(request, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_provider_is_unavailable() {
        let router = ProviderRouter::new();
        let request = ChatRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            temperature: None,
            system_prompt: None,
            max_tokens: None,
            correlation_id: None,
        };
        let err = router.send_message("missing", request).await.unwrap_err();
        assert_eq!(err, ProviderError::Unavailable("Unknown provider: missing".to_string()));
    }

    #[test]
    fn test_from_config_registers_each_entry() {
        let entries = vec![
            ProviderConfig {
                id: "local".to_string(),
                kind: ProviderKind::OpenAiCompatible,
                base_url: "http://127.0.0.1:8080/v1".to_string(),
                api_key_env: None,
            },
            ProviderConfig {
                id: "anthropic".to_string(),
                kind: ProviderKind::Claude,
                base_url: "https://api.anthropic.com/v1".to_string(),
                api_key_env: Some("CREDITCHAT_TEST_UNSET_KEY".to_string()),
            },
        ];
        let router = ProviderRouter::from_config(&entries);
        assert!(router.get("local").is_ok());
        assert!(router.get("anthropic").is_ok());
        assert!(router.get("openai").is_err());
    }
}
