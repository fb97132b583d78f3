use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::{
    Attachment, AttachmentKind, AuthContext, AvailableModel, Conversation, LedgerLink, Message,
    MessageStatus, Role,
};
use crate::services::catalog::{AttachmentStore, CachedModelRegistry, UsageSink};
use crate::services::chat::{CallOptions, ModelGateway};
use crate::services::context::{estimate_tokens, ContextAssembler};
use crate::services::conversation::{truncate_title, MessageCache};
use crate::services::database::Database;
use crate::services::ledger::{CreditLedger, Reservation};
use crate::services::stream::{ChatEvent, CreditsInfo, StreamTurn, StreamingCoordinator};

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessage {
    pub content: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchedTurn {
    pub user_message: Message,
    pub assistant_message: Message,
    pub conversation: Conversation,
    pub usage: Usage,
    pub credits_info: CreditsInfo,
}

#[derive(Debug)]
pub enum TurnResponse {
    Batched(Box<BatchedTurn>),
    Streaming(mpsc::Receiver<ChatEvent>),
}

/// A turn whose assistant message reached `completed`.
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    pub user_id: String,
    pub conversation_id: String,
    pub model: String,
    pub user_text: String,
    pub user_tokens: i64,
    pub assistant_tokens: i64,
    pub first_exchange: bool,
}

/// Bookkeeping after a successful turn, shared by the batched and streamed paths.
pub struct TurnEffects {
    db: Database,
    usage: Arc<dyn UsageSink>,
    messages: MessageCache,
    title_chars: usize,
}

impl TurnEffects {
    pub fn new(
        db: Database,
        usage: Arc<dyn UsageSink>,
        messages: MessageCache,
        title_chars: usize,
    ) -> Self {
        Self {
            db,
            usage,
            messages,
            title_chars,
        }
    }

    /// Counters, auto-title, quota usage and telemetry. The message is already
    /// terminal, so failures here are logged rather than returned.
    pub async fn apply(&self, turn: CompletedTurn) {
        let tokens = turn.user_tokens + turn.assistant_tokens;

        if let Err(e) = self
            .db
            .record_conversation_activity(&turn.conversation_id, 2, tokens, true)
            .await
        {
            tracing::error!("Failed to update conversation counters: {:#}", e);
        }
        if let Err(e) = self.db.add_tokens_used(&turn.user_id, tokens).await {
            tracing::error!("Failed to record token usage: {:#}", e);
        }

        if turn.first_exchange {
            let title = truncate_title(&turn.user_text, self.title_chars);
            if !title.is_empty() {
                if let Err(e) = self
                    .db
                    .update_conversation_title(&turn.conversation_id, &title)
                    .await
                {
                    tracing::error!("Failed to auto-title conversation: {:#}", e);
                }
            }
        }

        self.invalidate_messages(&turn.conversation_id).await;

        let usage = self.usage.clone();
        tokio::spawn(async move {
            if let Err(e) = usage
                .record(&turn.user_id, &turn.model, 2, tokens)
                .await
            {
                tracing::warn!("Failed to record usage statistics: {:#}", e);
            }
        });
    }

    pub async fn invalidate_messages(&self, conversation_id: &str) {
        self.messages.invalidate(&conversation_id.to_string()).await;
    }
}

/// Entry point for one inbound user message.
pub struct Orchestrator {
    db: Database,
    ledger: CreditLedger,
    models: Arc<CachedModelRegistry>,
    attachments: Arc<dyn AttachmentStore>,
    assembler: ContextAssembler,
    gateway: Arc<ModelGateway>,
    coordinator: Arc<StreamingCoordinator>,
    effects: Arc<TurnEffects>,
    chat: ChatConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        ledger: CreditLedger,
        models: Arc<CachedModelRegistry>,
        attachments: Arc<dyn AttachmentStore>,
        assembler: ContextAssembler,
        gateway: Arc<ModelGateway>,
        coordinator: Arc<StreamingCoordinator>,
        effects: Arc<TurnEffects>,
        chat: ChatConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            models,
            attachments,
            assembler,
            gateway,
            coordinator,
            effects,
            chat,
        }
    }

    pub async fn send_message(
        &self,
        auth: &AuthContext,
        conversation_id: &str,
        input: SendMessage,
    ) -> ChatResult<TurnResponse> {
        // Validation and pre-checks: nothing below touches the ledger
        let content = input.content.trim().to_string();
        if content.is_empty() {
            return Err(ChatError::validation("Message content cannot be empty"));
        }

        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or(ChatError::NotFound("Conversation"))?;
        if conversation.user_id != auth.user_id {
            return Err(ChatError::forbidden("Conversation belongs to another user"));
        }

        let model = self
            .models
            .find(&auth.user_id, auth.group_id.as_deref(), &conversation.model)
            .await?
            .ok_or_else(|| {
                ChatError::forbidden(format!("Model not available: {}", conversation.model))
            })?;

        let attachment = match &input.file_id {
            Some(file_id) => Some(self.validate_attachment(auth, &model, file_id).await?),
            None => None,
        };

        let user = self
            .db
            .get_user(&auth.user_id)
            .await?
            .ok_or(ChatError::NotFound("User"))?;
        if user.credits_expired(chrono::Utc::now()) {
            return Err(ChatError::CreditsExpired);
        }
        if user.credits < model.credits_per_chat {
            return Err(ChatError::InsufficientCredits {
                required: model.credits_per_chat,
                available: user.credits,
            });
        }
        if let Some(quota) = user.token_quota {
            if user.token_quota_exhausted() {
                return Err(ChatError::InsufficientTokenQuota {
                    used: user.tokens_used,
                    quota,
                });
            }
        }

        let reservation = self
            .ledger
            .reserve(
                &auth.user_id,
                model.credits_per_chat,
                LedgerLink {
                    model: Some(model.name.clone()),
                    conversation_id: Some(conversation.id.clone()),
                    memo: Some("chat turn".to_string()),
                },
            )
            .await?;

        // From here on every early return refunds first
        let mut user_message = Message::new(&conversation.id, Role::User, content.clone());
        user_message.status = MessageStatus::Completed;
        user_message.tokens = estimate_tokens(&content);
        user_message.file_id = attachment.as_ref().map(|a| a.id.clone());
        user_message.model = Some(model.name.clone());
        if let Err(e) = self.db.insert_message(&user_message).await {
            return Err(self
                .abort(&conversation.id, reservation, "user message not stored", e.into())
                .await);
        }

        let context = match self
            .assembler
            .build(&conversation, &model, &user_message, attachment.as_ref())
            .await
        {
            Ok(context) => context,
            Err(e) => {
                return Err(self
                    .abort(&conversation.id, reservation, "context assembly failed", e)
                    .await)
            }
        };

        let first_exchange =
            conversation.message_count == 0 && conversation.title == self.chat.default_title;
        let opts = CallOptions {
            temperature: Some(conversation.temperature),
            correlation_id: None,
        };

        if model.stream_enabled && input.stream {
            let request = ModelGateway::build_request(&model.name, context, opts);
            let rx = self
                .coordinator
                .start(StreamTurn {
                    conversation,
                    user_message,
                    reservation,
                    provider_id: model.provider.clone(),
                    request,
                    first_exchange,
                })
                .await?;
            return Ok(TurnResponse::Streaming(rx));
        }

        self.run_batched(
            conversation,
            &model,
            user_message,
            reservation,
            context,
            opts,
            first_exchange,
        )
        .await
        .map(|turn| TurnResponse::Batched(Box::new(turn)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batched(
        &self,
        conversation: Conversation,
        model: &AvailableModel,
        user_message: Message,
        reservation: Reservation,
        context: crate::services::context::AssembledContext,
        mut opts: CallOptions,
        first_exchange: bool,
    ) -> ChatResult<BatchedTurn> {
        let mut assistant = Message::new(&conversation.id, Role::Assistant, "");
        assistant.model = Some(model.name.clone());
        assistant.parent_message_id = Some(user_message.id.clone());
        opts.correlation_id = Some(assistant.id.clone());

        let request = ModelGateway::build_request(&model.name, context, opts);
        let response = match self.gateway.send_batch(&model.provider, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    model = %model.name,
                    "Provider call failed: {}",
                    e
                );
                return Err(self
                    .abort(&conversation.id, reservation, "provider call failed", e.into())
                    .await);
            }
        };

        let completion_tokens = response
            .tokens_out
            .unwrap_or_else(|| estimate_tokens(&response.content));
        assistant.content = response.content;
        assistant.artifacts = response.artifacts;
        assistant.tokens = completion_tokens;
        assistant.status = MessageStatus::Completed;
        assistant.updated_at = chrono::Utc::now();

        if let Err(e) = self.db.insert_message(&assistant).await {
            return Err(self
                .abort(&conversation.id, reservation, "assistant message not stored", e.into())
                .await);
        }
        let credits_info = CreditsInfo {
            reserved: reservation.amount(),
            balance_after: reservation.balance_after(),
        };
        reservation.commit();

        self.effects
            .apply(CompletedTurn {
                user_id: conversation.user_id.clone(),
                conversation_id: conversation.id.clone(),
                model: model.name.clone(),
                user_text: user_message.content.clone(),
                user_tokens: user_message.tokens,
                assistant_tokens: completion_tokens,
                first_exchange,
            })
            .await;

        let conversation = self
            .db
            .get_conversation(&conversation.id)
            .await?
            .unwrap_or(conversation);

        Ok(BatchedTurn {
            usage: Usage {
                prompt_tokens: response.tokens_in.unwrap_or(user_message.tokens),
                completion_tokens,
                total_tokens: user_message.tokens + completion_tokens,
            },
            user_message,
            assistant_message: assistant,
            conversation,
            credits_info,
        })
    }

    async fn validate_attachment(
        &self,
        auth: &AuthContext,
        model: &AvailableModel,
        file_id: &str,
    ) -> ChatResult<Attachment> {
        let attachment = self
            .attachments
            .find_by_id(file_id)
            .await?
            .ok_or(ChatError::NotFound("Attachment"))?;
        if attachment.user_id != auth.user_id {
            return Err(ChatError::forbidden("Attachment belongs to another user"));
        }
        let kind = attachment.kind();
        if !model.supports(kind) {
            let what = match kind {
                AttachmentKind::Image => "image",
                AttachmentKind::Document => "document",
            };
            return Err(ChatError::validation(format!(
                "Model {} does not accept {} uploads",
                model.name, what
            )));
        }
        Ok(attachment)
    }

    /// Refund, then hand back the error for the caller to surface. The user
    /// turn may already be stored, so cached listings are dropped too.
    async fn abort(
        &self,
        conversation_id: &str,
        reservation: Reservation,
        memo: &str,
        err: ChatError,
    ) -> ChatError {
        if let Err(refund_err) = reservation.refund(memo).await {
            tracing::error!("Failed to refund reservation ({}): {}", memo, refund_err);
        }
        self.effects.invalidate_messages(conversation_id).await;
        err
    }
}
