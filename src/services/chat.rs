use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::providers::{ChatRequest, ChatResponse, ProviderError, ProviderRouter, StreamEvent};
use crate::services::context::AssembledContext;

/// Per-call options forwarded to the provider.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub temperature: Option<f32>,
    pub correlation_id: Option<String>,
}

/// Provider-independent entry point for batched and streamed model calls.
pub struct ModelGateway {
    router: Arc<ProviderRouter>,
    request_timeout: Duration,
    idle_timeout: Duration,
    buffer: usize,
}

impl ModelGateway {
    pub fn new(router: Arc<ProviderRouter>, request_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            router,
            request_timeout,
            idle_timeout,
            buffer: 64,
        }
    }

    pub fn build_request(model: &str, context: AssembledContext, opts: CallOptions) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: context.messages,
            temperature: opts.temperature,
            system_prompt: context.system_prompt.filter(|s| !s.trim().is_empty()),
            max_tokens: None,
            correlation_id: opts.correlation_id,
        }
    }

    pub async fn send_batch(
        &self,
        provider_id: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        match tokio::time::timeout(
            self.request_timeout,
            self.router.send_message(provider_id, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "no response after {}s",
                self.request_timeout.as_secs()
            ))),
        }
    }

    /// Start a streamed call. The returned channel yields tokens and artifacts in
    /// provider order and always ends with exactly one `Done` or `Error`.
    /// Dropping the receiver aborts the provider request.
    pub fn send_stream(&self, provider_id: &str, request: ChatRequest) -> mpsc::Receiver<StreamEvent> {
        let (provider_tx, mut provider_rx) = mpsc::channel::<StreamEvent>(self.buffer);
        let (tx, rx) = mpsc::channel::<StreamEvent>(self.buffer);

        let router = self.router.clone();
        let provider_id = provider_id.to_string();
        let producer = tokio::spawn(async move {
            if let Err(e) = router
                .stream_message(&provider_id, request, provider_tx.clone())
                .await
            {
                let _ = provider_tx.send(StreamEvent::Error(e)).await;
            }
        });

        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            let mut saw_output = false;
            loop {
                let event = match tokio::time::timeout(idle_timeout, provider_rx.recv()).await {
                    Ok(Some(event)) => event,
                    Ok(None) if saw_output => StreamEvent::Done {
                        tokens_in: None,
                        tokens_out: None,
                    },
                    Ok(None) => StreamEvent::Error(ProviderError::Unknown(
                        "Stream ended unexpectedly".to_string(),
                    )),
                    Err(_) => StreamEvent::Error(ProviderError::Timeout(format!(
                        "no output for {}s",
                        idle_timeout.as_secs()
                    ))),
                };

                let terminal = matches!(event, StreamEvent::Done { .. } | StreamEvent::Error(_));
                saw_output |= matches!(event, StreamEvent::Token(_) | StreamEvent::Artifact(_));

                if tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
            producer.abort();
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::providers::{AiProvider, ChatMessage};
    use async_trait::async_trait;

    enum Behaviour {
        TokensThenClose(Vec<&'static str>),
        TokenThenHang,
        SlowBatch,
    }

    struct FakeProvider(Behaviour);

    #[async_trait]
    impl AiProvider for FakeProvider {
        fn provider_id(&self) -> &str {
            "fake"
        }

        async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            if matches!(self.0, Behaviour::SlowBatch) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(ChatResponse {
                content: "ok".to_string(),
                model: request.model,
                tokens_in: None,
                tokens_out: None,
                artifacts: Vec::new(),
            })
        }

        async fn stream_message(
            &self,
            _request: ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            match &self.0 {
                Behaviour::TokensThenClose(tokens) => {
                    for t in tokens {
                        let _ = tx.send(StreamEvent::Token(t.to_string())).await;
                    }
                }
                Behaviour::TokenThenHang => {
                    let _ = tx.send(StreamEvent::Token("Hel".to_string())).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Behaviour::SlowBatch => {}
            }
            Ok(())
        }
    }

    fn gateway(behaviour: Behaviour) -> ModelGateway {
        let mut router = ProviderRouter::new();
        router.register(Arc::new(FakeProvider(behaviour)));
        ModelGateway::new(
            Arc::new(router),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    fn request() -> ChatRequest {
        ModelGateway::build_request(
            "m",
            AssembledContext {
                system_prompt: Some("  ".to_string()),
                messages: vec![ChatMessage::text(Role::User, "Hi")],
            },
            CallOptions::default(),
        )
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_blank_system_prompt_is_dropped() {
        assert!(request().system_prompt.is_none());
    }

    #[tokio::test]
    async fn test_closed_stream_after_output_is_done() {
        let gw = gateway(Behaviour::TokensThenClose(vec!["Hel", "lo"]));
        let events = collect(gw.send_stream("fake", request())).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn test_closed_stream_without_output_is_error() {
        let gw = gateway(Behaviour::TokensThenClose(Vec::new()));
        let events = collect(gw.send_stream("fake", request())).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(ProviderError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_idle_stream_times_out() {
        let gw = gateway(Behaviour::TokenThenHang);
        let events = collect(gw.send_stream("fake", request())).await;
        assert!(matches!(events[0], StreamEvent::Token(_)));
        assert!(matches!(events[1], StreamEvent::Error(ProviderError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_batch_timeout_and_unknown_provider() {
        let gw = gateway(Behaviour::SlowBatch);
        let err = gw.send_batch("fake", request()).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");

        let err = gw.send_batch("missing", request()).await.unwrap_err();
        assert_eq!(err.kind(), "provider_unavailable");
    }
}
