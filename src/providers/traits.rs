use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, ChatResponse, ProviderError, StreamEvent};

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Id of the configured provider entry this adapter serves.
    fn provider_id(&self) -> &str;

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Push incremental events to `tx`, normally ending with `Done` or `Error`.
    /// Returning without either counts as the upstream closing early.
    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}
