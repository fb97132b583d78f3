use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChatResult;
use crate::models::{Artifact, Conversation, Message, MessageStatus, Role};
use crate::providers::{ChatRequest, StreamEvent};
use crate::services::chat::ModelGateway;
use crate::services::context::estimate_tokens;
use crate::services::database::{Database, TerminalWrite};
use crate::services::ledger::Reservation;
use crate::services::orchestrator::{CompletedTurn, TurnEffects};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CreditsInfo {
    pub reserved: i64,
    pub balance_after: i64,
}

/// Client-facing events of a streamed turn: `Init`, any number of `Chunk`,
/// then exactly one `Complete` or `Error`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChatEvent {
    Init {
        user_message: Message,
        ai_message_id: String,
        credits_info: CreditsInfo,
    },
    Chunk {
        #[serde(rename = "fullContent")]
        full_content: String,
    },
    Complete {
        content: String,
        tokens: i64,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Artifact>,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Init { .. } => "init",
            ChatEvent::Chunk { .. } => "chunk",
            ChatEvent::Complete { .. } => "complete",
            ChatEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Complete { .. } | ChatEvent::Error { .. })
    }
}

/// Cancellation handles of in-flight streams, keyed by assistant message id.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, message_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(message_id.to_string(), token.clone());
        token
    }

    /// Returns false when no stream with that id is running here.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.lock().get(message_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, message_id: &str) {
        self.lock().remove(message_id);
    }

    pub fn is_active(&self, message_id: &str) -> bool {
        self.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn cancel_all(&self) {
        for token in self.lock().values() {
            token.cancel();
        }
    }
}

/// Everything the coordinator needs to run one streamed turn.
pub struct StreamTurn {
    pub conversation: Conversation,
    pub user_message: Message,
    pub reservation: Reservation,
    pub provider_id: String,
    pub request: ChatRequest,
    pub first_exchange: bool,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub checkpoint_interval: Duration,
    pub stopped_marker: String,
    pub client_buffer: usize,
}

enum Ending {
    Finished {
        tokens_out: Option<i64>,
    },
    Failed(String),
    Stopped,
    /// The row went terminal under us (stale-stream recovery).
    Lost,
}

pub struct StreamingCoordinator {
    db: Database,
    gateway: Arc<ModelGateway>,
    registry: StreamRegistry,
    effects: Arc<TurnEffects>,
    settings: StreamSettings,
}

impl StreamingCoordinator {
    pub fn new(
        db: Database,
        gateway: Arc<ModelGateway>,
        registry: StreamRegistry,
        effects: Arc<TurnEffects>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            registry,
            effects,
            settings,
        }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Create the `streaming` placeholder, queue the `init` event and start
    /// relaying in the background. The placeholder id doubles as the provider
    /// correlation id.
    pub async fn start(
        self: &Arc<Self>,
        mut turn: StreamTurn,
    ) -> ChatResult<mpsc::Receiver<ChatEvent>> {
        let mut placeholder = Message::new(&turn.conversation.id, Role::Assistant, "");
        placeholder.status = MessageStatus::Streaming;
        placeholder.model = Some(turn.conversation.model.clone());
        placeholder.parent_message_id = Some(turn.user_message.id.clone());
        placeholder.reserved_credits = turn.reservation.amount();

        if let Err(e) = self.db.insert_message(&placeholder).await {
            tracing::error!("Failed to create streaming placeholder: {:#}", e);
            turn.reservation.refund("placeholder not created").await?;
            self.effects.invalidate_messages(&turn.conversation.id).await;
            return Err(e.into());
        }
        turn.reservation.attach_message(&placeholder.id);
        turn.request.correlation_id = Some(placeholder.id.clone());
        self.effects.invalidate_messages(&turn.conversation.id).await;

        let (client_tx, client_rx) = mpsc::channel(self.settings.client_buffer.max(1));
        let init = ChatEvent::Init {
            user_message: turn.user_message.clone(),
            ai_message_id: placeholder.id.clone(),
            credits_info: CreditsInfo {
                reserved: turn.reservation.amount(),
                balance_after: turn.reservation.balance_after(),
            },
        };
        if let Err(e) = client_tx.try_send(init) {
            tracing::warn!(message_id = %placeholder.id, "Failed to queue init event: {}", e);
        }

        let cancel = self.registry.register(&placeholder.id);
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let message_id = placeholder.id.clone();
            coordinator.drive(turn, placeholder, cancel, client_tx).await;
            coordinator.registry.remove(&message_id);
        });

        Ok(client_rx)
    }

    async fn drive(
        &self,
        turn: StreamTurn,
        placeholder: Message,
        cancel: CancellationToken,
        client_tx: mpsc::Sender<ChatEvent>,
    ) {
        let StreamTurn {
            conversation,
            user_message,
            reservation,
            provider_id,
            request,
            first_exchange,
        } = turn;
        let message_id = placeholder.id;

        tracing::info!(
            conversation_id = %conversation.id,
            message_id = %message_id,
            model = %conversation.model,
            "Streaming turn started"
        );

        let mut events = self.gateway.send_stream(&provider_id, request);
        let mut content = String::new();
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut client_alive = true;
        let mut last_checkpoint = Instant::now();

        let ending = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ending::Stopped,
                event = events.recv() => match event {
                    Some(StreamEvent::Token(token)) => {
                        content.push_str(&token);
                        if client_alive {
                            let chunk = ChatEvent::Chunk { full_content: content.clone() };
                            // A slow reader must not hold up a stop request
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break Ending::Stopped,
                                sent = client_tx.send(chunk) => {
                                    if sent.is_err() {
                                        tracing::info!(message_id = %message_id, "Client disconnected, stopping stream");
                                        client_alive = false;
                                        cancel.cancel();
                                    }
                                }
                            }
                        }
                        if last_checkpoint.elapsed() >= self.settings.checkpoint_interval {
                            last_checkpoint = Instant::now();
                            match self.db.checkpoint_message(&message_id, &content).await {
                                Ok(true) => {}
                                Ok(false) => break Ending::Lost,
                                Err(e) => tracing::warn!("Failed to checkpoint stream: {:#}", e),
                            }
                        }
                    }
                    Some(StreamEvent::Artifact(artifact)) => artifacts.push(artifact),
                    Some(StreamEvent::Done { tokens_out, .. }) => {
                        break Ending::Finished { tokens_out };
                    }
                    Some(StreamEvent::Error(e)) => break Ending::Failed(e.to_string()),
                    None => break Ending::Failed("Stream ended unexpectedly".to_string()),
                },
            }
        };
        // Stops the provider request if it is still running
        drop(events);

        let terminal = match ending {
            Ending::Finished { tokens_out, .. } => {
                let tokens = tokens_out.unwrap_or_else(|| estimate_tokens(&content));
                let write = TerminalWrite {
                    message_id: message_id.clone(),
                    status: MessageStatus::Completed,
                    content: content.clone(),
                    tokens,
                    artifacts: artifacts.clone(),
                };
                match reservation.settle(write).await {
                    Ok(true) => {
                        self.effects
                            .apply(CompletedTurn {
                                user_id: conversation.user_id.clone(),
                                conversation_id: conversation.id.clone(),
                                model: conversation.model.clone(),
                                user_text: user_message.content.clone(),
                                user_tokens: user_message.tokens,
                                assistant_tokens: tokens,
                                first_exchange,
                            })
                            .await;
                        ChatEvent::Complete {
                            content,
                            tokens,
                            artifacts,
                        }
                    }
                    Ok(false) => ChatEvent::Error {
                        message: "Generation was interrupted".to_string(),
                    },
                    Err(e) => {
                        tracing::error!("Failed to complete streamed message: {}", e);
                        ChatEvent::Error {
                            message: e.to_string(),
                        }
                    }
                }
            }
            Ending::Failed(reason) => {
                tracing::warn!(message_id = %message_id, "Stream failed: {}", reason);
                self.fail(reservation, &message_id, content, artifacts).await;
                ChatEvent::Error { message: reason }
            }
            Ending::Stopped => {
                let annotated = if content.is_empty() {
                    self.settings.stopped_marker.trim_start().to_string()
                } else {
                    format!("{}{}", content, self.settings.stopped_marker)
                };
                tracing::info!(message_id = %message_id, "Stream stopped");
                self.fail(reservation, &message_id, annotated.clone(), artifacts)
                    .await;
                if client_alive {
                    let _ = client_tx
                        .send(ChatEvent::Chunk {
                            full_content: annotated,
                        })
                        .await;
                }
                ChatEvent::Error {
                    message: "Generation stopped".to_string(),
                }
            }
            Ending::Lost => {
                // Recovery already failed the row and refunded it
                reservation.commit();
                ChatEvent::Error {
                    message: "Generation was interrupted".to_string(),
                }
            }
        };

        self.effects.invalidate_messages(&conversation.id).await;

        if client_alive && client_tx.send(terminal).await.is_err() {
            tracing::debug!(message_id = %message_id, "Client gone before terminal event");
        }
    }

    async fn fail(
        &self,
        reservation: Reservation,
        message_id: &str,
        content: String,
        artifacts: Vec<Artifact>,
    ) {
        let write = TerminalWrite {
            message_id: message_id.to_string(),
            status: MessageStatus::Failed,
            content,
            tokens: 0,
            artifacts,
        };
        if let Err(e) = reservation.settle(write).await {
            tracing::error!("Failed to settle failed stream {}: {}", message_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_cancel_and_remove() {
        let registry = StreamRegistry::new();
        let token = registry.register("m1");
        assert!(registry.is_active("m1"));
        assert!(registry.cancel("m1"));
        assert!(token.is_cancelled());

        registry.remove("m1");
        assert!(!registry.is_active("m1"));
        assert!(!registry.cancel("m1"));
    }

    #[test]
    fn test_event_wire_shape() {
        let chunk = ChatEvent::Chunk {
            full_content: "Hel".to_string(),
        };
        assert_eq!(chunk.name(), "chunk");
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            serde_json::json!({ "fullContent": "Hel" })
        );

        let complete = ChatEvent::Complete {
            content: "Hello".to_string(),
            tokens: 2,
            artifacts: Vec::new(),
        };
        assert!(complete.is_terminal());
        assert_eq!(
            serde_json::to_value(&complete).unwrap(),
            serde_json::json!({ "content": "Hello", "tokens": 2 })
        );
    }
}
