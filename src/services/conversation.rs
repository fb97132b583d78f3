use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::conversation::{clamp_temperature, MAX_CONTEXT_LENGTH};
use crate::models::{AuthContext, Conversation, Message, MessageStatus, PromptSource, Role};
use crate::services::cache::TtlCache;
use crate::services::catalog::CachedModelRegistry;
use crate::services::database::Database;
use crate::services::stream::StreamRegistry;

/// Message lists keyed by conversation id.
pub type MessageCache = TtlCache<String, Vec<Message>>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateConversation {
    pub title: Option<String>,
    pub model: String,
    #[serde(default)]
    pub prompt: Option<PromptSource>,
    pub context_length: Option<i64>,
    pub temperature: Option<f32>,
    pub priority: Option<i64>,
}

/// Settings edit. Absent fields are left unchanged; a present `prompt`
/// replaces whichever prompt source was configured before.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateConversation {
    pub title: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<PromptSource>,
    pub context_length: Option<i64>,
    pub temperature: Option<f32>,
    pub priority: Option<i64>,
}

pub struct ConversationService {
    db: Database,
    models: Arc<CachedModelRegistry>,
    registry: StreamRegistry,
    messages: MessageCache,
    chat: ChatConfig,
}

impl ConversationService {
    pub fn new(
        db: Database,
        models: Arc<CachedModelRegistry>,
        registry: StreamRegistry,
        messages: MessageCache,
        chat: ChatConfig,
    ) -> Self {
        Self {
            db,
            models,
            registry,
            messages,
            chat,
        }
    }

    pub async fn create(
        &self,
        auth: &AuthContext,
        input: CreateConversation,
    ) -> ChatResult<Conversation> {
        self.ensure_model_available(auth, &input.model).await?;
        let context_length = validate_context_length(
            input
                .context_length
                .unwrap_or(self.chat.default_context_length),
        )?;

        let title = input
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.chat.default_title.clone());

        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: auth.user_id.clone(),
            title,
            model: input.model,
            prompt: input.prompt.unwrap_or(PromptSource::None),
            context_length,
            temperature: clamp_temperature(
                input.temperature.unwrap_or(self.chat.default_temperature),
            ),
            priority: input.priority.unwrap_or(0),
            message_count: 0,
            total_tokens: 0,
            created_at: Utc::now(),
            last_message_at: None,
            cleared_at: None,
        };
        self.db.insert_conversation(&conversation).await?;

        tracing::info!(conversation_id = %conversation.id, user_id = %auth.user_id, "Created conversation");
        Ok(conversation)
    }

    pub async fn list(&self, auth: &AuthContext) -> ChatResult<Vec<Conversation>> {
        Ok(self.db.list_conversations(&auth.user_id).await?)
    }

    /// Load a conversation and check that `auth` owns it.
    pub async fn get_owned(&self, auth: &AuthContext, id: &str) -> ChatResult<Conversation> {
        let conversation = self
            .db
            .get_conversation(id)
            .await?
            .ok_or(ChatError::NotFound("Conversation"))?;
        if conversation.user_id != auth.user_id {
            return Err(ChatError::forbidden("Conversation belongs to another user"));
        }
        Ok(conversation)
    }

    pub async fn update(
        &self,
        auth: &AuthContext,
        id: &str,
        input: UpdateConversation,
    ) -> ChatResult<Conversation> {
        let mut conversation = self.get_owned(auth, id).await?;

        if let Some(title) = input.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(ChatError::validation("Title cannot be empty"));
            }
            conversation.title = title.to_string();
        }
        if let Some(model) = input.model {
            self.ensure_model_available(auth, &model).await?;
            conversation.model = model;
        }
        if let Some(prompt) = input.prompt {
            conversation.prompt = prompt;
        }
        if let Some(context_length) = input.context_length {
            conversation.context_length = validate_context_length(context_length)?;
        }
        if let Some(temperature) = input.temperature {
            conversation.temperature = clamp_temperature(temperature);
        }
        if let Some(priority) = input.priority {
            conversation.priority = priority;
        }

        self.db.update_conversation_settings(&conversation).await?;
        Ok(conversation)
    }

    /// Hide all current messages behind a watermark and reset the counters.
    pub async fn clear(&self, auth: &AuthContext, id: &str) -> ChatResult<Conversation> {
        self.get_owned(auth, id).await?;
        self.db.clear_conversation(id, Utc::now()).await?;
        self.messages.invalidate(&id.to_string()).await;
        self.get_owned(auth, id).await
    }

    pub async fn delete(&self, auth: &AuthContext, id: &str) -> ChatResult<()> {
        self.get_owned(auth, id).await?;
        let open = self.db.delete_conversation(id).await?;
        for message_id in &open {
            self.registry.cancel(message_id);
        }
        self.messages.invalidate(&id.to_string()).await;
        tracing::info!(conversation_id = %id, stopped = open.len(), "Deleted conversation");
        Ok(())
    }

    /// Visible messages, oldest first. Orphaned streams are failed (and
    /// refunded) before anything else is looked at.
    pub async fn list_messages(&self, auth: &AuthContext, id: &str) -> ChatResult<Vec<Message>> {
        let cutoff = Utc::now() - self.chat.stale_after();
        let recovered = self.db.recover_stale_streams(Some(id), cutoff).await?;
        if !recovered.is_empty() {
            tracing::warn!(
                conversation_id = %id,
                count = recovered.len(),
                "Recovered stale streaming messages"
            );
            self.messages.invalidate(&id.to_string()).await;
        }

        let conversation = self.get_owned(auth, id).await?;
        let db = self.db.clone();
        // Open rows change with every checkpoint, so such lists are read fresh
        let messages = self
            .messages
            .get_or_load_if(
                id.to_string(),
                || async move { db.list_messages(&conversation.id, conversation.cleared_at).await },
                |messages| messages.iter().all(|m| m.status.is_terminal()),
            )
            .await?;
        Ok(messages)
    }

    /// Delete an assistant message together with the user message it answers.
    pub async fn delete_message(&self, auth: &AuthContext, message_id: &str) -> ChatResult<()> {
        let message = self
            .db
            .get_message(message_id)
            .await?
            .ok_or(ChatError::NotFound("Message"))?;
        let conversation = self.get_owned(auth, &message.conversation_id).await?;

        if message.role == Role::User {
            return Err(ChatError::forbidden(
                "User messages are deleted together with their reply",
            ));
        }
        if !message.status.is_terminal() {
            return Err(ChatError::validation("Message is still being generated"));
        }

        let deleted = self.db.delete_message_pair(message_id).await?;
        self.db
            .record_conversation_activity(&conversation.id, -deleted.messages, -deleted.tokens, false)
            .await?;
        self.messages.invalidate(&conversation.id).await;
        Ok(())
    }

    /// Ask a running stream to stop. Returns false when the message is not
    /// streaming in this process.
    pub async fn stop(&self, auth: &AuthContext, message_id: &str) -> ChatResult<bool> {
        let message = self
            .db
            .get_message(message_id)
            .await?
            .ok_or(ChatError::NotFound("Message"))?;
        self.get_owned(auth, &message.conversation_id).await?;

        if message.status != MessageStatus::Streaming {
            return Ok(false);
        }
        Ok(self.registry.cancel(message_id))
    }

    async fn ensure_model_available(&self, auth: &AuthContext, model: &str) -> ChatResult<()> {
        let found = self
            .models
            .find(&auth.user_id, auth.group_id.as_deref(), model)
            .await?;
        if found.is_none() {
            return Err(ChatError::forbidden(format!("Model not available: {}", model)));
        }
        Ok(())
    }
}

fn validate_context_length(value: i64) -> ChatResult<i64> {
    if !(0..=MAX_CONTEXT_LENGTH).contains(&value) {
        return Err(ChatError::validation(format!(
            "Context length must be between 0 and {}",
            MAX_CONTEXT_LENGTH
        )));
    }
    Ok(value)
}

/// First `max_chars` characters of the first non-empty line.
pub fn truncate_title(text: &str, max_chars: usize) -> String {
    let first_line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    first_line.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UserAccount, UserRole};
    use crate::services::catalog::SqliteCatalog;
    use std::time::Duration;

    fn auth(user: &str) -> AuthContext {
        AuthContext {
            user_id: user.to_string(),
            role: UserRole::User,
            group_id: None,
        }
    }

    async fn service() -> (Database, ConversationService) {
        let db = Database::new_in_memory().unwrap();
        db.insert_user(&UserAccount::new("u1")).await.unwrap();
        db.insert_user(&UserAccount::new("u2")).await.unwrap();
        db.conn_ref()
            .lock()
            .unwrap()
            .execute_batch(
                "INSERT INTO ai_models (name, provider, credits_per_chat) VALUES ('m', 'p', 10), ('m2', 'p', 1);",
            )
            .unwrap();
        let models = Arc::new(CachedModelRegistry::new(
            Arc::new(SqliteCatalog::new(db.clone())),
            Duration::from_secs(60),
        ));
        let svc = ConversationService::new(
            db.clone(),
            models,
            StreamRegistry::new(),
            MessageCache::new(Duration::from_secs(30)),
            ChatConfig::default(),
        );
        (db, svc)
    }

    fn new_conversation() -> CreateConversation {
        CreateConversation {
            model: "m".to_string(),
            ..CreateConversation::default()
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let (_, svc) = service().await;
        let conv = svc.create(&auth("u1"), new_conversation()).await.unwrap();
        assert_eq!(conv.title, "New Chat");
        assert_eq!(conv.context_length, 20);
        assert!((conv.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(conv.prompt, PromptSource::None);
    }

    #[tokio::test]
    async fn test_create_rejects_unavailable_model() {
        let (_, svc) = service().await;
        let err = svc
            .create(
                &auth("u1"),
                CreateConversation {
                    model: "ghost".to_string(),
                    ..CreateConversation::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_update_enforces_bounds_and_exclusive_prompt() {
        let (_, svc) = service().await;
        let conv = svc.create(&auth("u1"), new_conversation()).await.unwrap();

        let err = svc
            .update(
                &auth("u1"),
                &conv.id,
                UpdateConversation {
                    context_length: Some(1001),
                    ..UpdateConversation::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        svc.update(
            &auth("u1"),
            &conv.id,
            UpdateConversation {
                prompt: Some(PromptSource::Named("p1".to_string())),
                ..UpdateConversation::default()
            },
        )
        .await
        .unwrap();
        let updated = svc
            .update(
                &auth("u1"),
                &conv.id,
                UpdateConversation {
                    prompt: Some(PromptSource::ModuleCombination("c1".to_string())),
                    temperature: Some(3.5),
                    ..UpdateConversation::default()
                },
            )
            .await
            .unwrap();

        let stored = svc.get_owned(&auth("u1"), &conv.id).await.unwrap();
        assert_eq!(stored.prompt, PromptSource::ModuleCombination("c1".to_string()));
        assert_eq!(updated.temperature, 1.0);
    }

    #[tokio::test]
    async fn test_other_users_are_forbidden() {
        let (_, svc) = service().await;
        let conv = svc.create(&auth("u1"), new_conversation()).await.unwrap();

        let err = svc.list_messages(&auth("u2"), &conv.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));
        let err = svc.get_owned(&auth("u1"), "missing").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound("Conversation")));
    }

    #[tokio::test]
    async fn test_clear_hides_messages_and_resets_counters() {
        let (db, svc) = service().await;
        let conv = svc.create(&auth("u1"), new_conversation()).await.unwrap();

        let mut msg = Message::new(&conv.id, Role::User, "old");
        msg.status = MessageStatus::Completed;
        msg.created_at = Utc::now() - chrono::Duration::seconds(5);
        db.insert_message(&msg).await.unwrap();
        db.record_conversation_activity(&conv.id, 1, 4, true).await.unwrap();
        assert_eq!(svc.list_messages(&auth("u1"), &conv.id).await.unwrap().len(), 1);

        let cleared = svc.clear(&auth("u1"), &conv.id).await.unwrap();
        assert_eq!(cleared.message_count, 0);
        assert_eq!(cleared.total_tokens, 0);
        assert!(cleared.cleared_at.is_some());
        assert!(svc.list_messages(&auth("u1"), &conv.id).await.unwrap().is_empty());
        // Still stored for audit
        assert!(db.get_message(&msg.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_user_message_cannot_be_deleted_directly() {
        let (db, svc) = service().await;
        let conv = svc.create(&auth("u1"), new_conversation()).await.unwrap();

        let mut question = Message::new(&conv.id, Role::User, "Q");
        question.status = MessageStatus::Completed;
        question.tokens = 1;
        db.insert_message(&question).await.unwrap();
        let mut answer = Message::new(&conv.id, Role::Assistant, "A");
        answer.status = MessageStatus::Completed;
        answer.tokens = 3;
        answer.parent_message_id = Some(question.id.clone());
        db.insert_message(&answer).await.unwrap();
        db.record_conversation_activity(&conv.id, 2, 4, true).await.unwrap();

        let err = svc.delete_message(&auth("u1"), &question.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));

        svc.delete_message(&auth("u1"), &answer.id).await.unwrap();
        assert!(db.get_message(&question.id).await.unwrap().is_none());
        let conv = svc.get_owned(&auth("u1"), &conv.id).await.unwrap();
        assert_eq!(conv.message_count, 0);
        assert_eq!(conv.total_tokens, 0);
    }

    #[tokio::test]
    async fn test_streaming_message_cannot_be_deleted() {
        let (db, svc) = service().await;
        let conv = svc.create(&auth("u1"), new_conversation()).await.unwrap();
        let mut msg = Message::new(&conv.id, Role::Assistant, "");
        msg.status = MessageStatus::Streaming;
        db.insert_message(&msg).await.unwrap();

        let err = svc.delete_message(&auth("u1"), &msg.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(!svc.stop(&auth("u1"), &msg.id).await.unwrap());
    }

    #[test]
    fn test_truncate_title() {
        assert_eq!(
            truncate_title("What is the capital of France?", 30),
            "What is the capital of France?"
        );
        assert_eq!(
            truncate_title("Explain the borrow checker to me like I am five", 30),
            "Explain the borrow checker to"
        );
        assert_eq!(truncate_title("\n  héllo wörld\nsecond", 5), "héllo");
    }
}
