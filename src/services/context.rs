use std::sync::Arc;

use crate::error::ChatResult;
use crate::models::{
    Attachment, AttachmentKind, AvailableModel, Conversation, Message, PromptSource, Role,
};
use crate::providers::{ChatMessage, ImageRef};
use crate::services::catalog::{AttachmentStore, PromptResolver};
use crate::services::database::Database;

/// Assistant half of the synthetic exchange that carries module-combination
/// content ahead of the real history.
pub const CONTINUE_REPLY: &str = "I have understood the above. Please continue.";

/// Model input for one turn.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// Rough token count used when the provider reports no usage.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}

pub struct ContextAssembler {
    db: Database,
    prompts: Arc<dyn PromptResolver>,
    attachments: Arc<dyn AttachmentStore>,
}

impl ContextAssembler {
    pub fn new(
        db: Database,
        prompts: Arc<dyn PromptResolver>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        Self {
            db,
            prompts,
            attachments,
        }
    }

    /// Build the ordered turns for `user_message`, which must already be stored.
    pub async fn build(
        &self,
        conversation: &Conversation,
        model: &AvailableModel,
        user_message: &Message,
        attachment: Option<&Attachment>,
    ) -> ChatResult<AssembledContext> {
        let mut context = AssembledContext::default();

        match &conversation.prompt {
            PromptSource::ModuleCombination(id) => {
                match self.prompts.combined_content(id, &conversation.user_id).await {
                    Ok(Some(combined)) => {
                        context.system_prompt = combined.system_prompt;
                        if let Some(normal) = combined.normal_prompt {
                            context.messages.push(ChatMessage::text(Role::User, normal));
                            context
                                .messages
                                .push(ChatMessage::text(Role::Assistant, CONTINUE_REPLY));
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(combination_id = %id, "Module combination not found");
                    }
                    Err(e) => {
                        tracing::error!("Failed to resolve module combination {}: {:#}", id, e);
                    }
                }
            }
            PromptSource::Named(id) => match self.prompts.prompt_content(id).await {
                Ok(Some(content)) => context.system_prompt = Some(content),
                Ok(None) => tracing::warn!(prompt_id = %id, "System prompt not found"),
                Err(e) => tracing::error!("Failed to resolve system prompt {}: {:#}", id, e),
            },
            PromptSource::Inline(text) => context.system_prompt = Some(text.clone()),
            PromptSource::None => {}
        }

        let history = self.load_history(conversation, &user_message.id).await?;
        for turn in &history {
            let mut msg = ChatMessage::text(turn.role, turn.content.clone());
            if let Some(file_id) = &turn.file_id {
                if let Some(image) = self.history_image(model, file_id).await {
                    msg.images.push(image);
                }
            }
            context.messages.push(msg);
        }

        context
            .messages
            .push(Self::current_turn(model, &user_message.content, attachment));

        Ok(context)
    }

    /// The most recent `context_length` completed turns before the current one.
    async fn load_history(
        &self,
        conversation: &Conversation,
        current_id: &str,
    ) -> ChatResult<Vec<Message>> {
        let window = conversation.context_length;
        if window <= 0 {
            return Ok(Vec::new());
        }
        let mut history = self
            .db
            .list_history(&conversation.id, conversation.cleared_at, window + 1)
            .await?;
        history.retain(|m| m.id != current_id);
        let excess = history.len().saturating_sub(window as usize);
        history.drain(..excess);
        Ok(history)
    }

    async fn history_image(&self, model: &AvailableModel, file_id: &str) -> Option<ImageRef> {
        if !model.supports(AttachmentKind::Image) {
            return None;
        }
        match self.attachments.find_by_id(file_id).await {
            Ok(Some(file)) if file.kind() == AttachmentKind::Image => Some(ImageRef {
                mime_type: file.mime_type,
                url: file.url,
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Failed to load attachment {}: {:#}", file_id, e);
                None
            }
        }
    }

    fn current_turn(
        model: &AvailableModel,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> ChatMessage {
        let Some(file) = attachment else {
            return ChatMessage::text(Role::User, text);
        };

        match file.kind() {
            AttachmentKind::Image if model.supports(AttachmentKind::Image) => ChatMessage {
                role: Role::User,
                content: text.to_string(),
                images: vec![ImageRef {
                    mime_type: file.mime_type.clone(),
                    url: file.url.clone(),
                }],
            },
            AttachmentKind::Document => match file.extracted_content.as_deref() {
                Some(extracted) if !extracted.trim().is_empty() => {
                    let name = file.filename.as_deref().unwrap_or("document");
                    ChatMessage::text(
                        Role::User,
                        format!("[File: {}]\n{}\n\n{}", name, extracted, text),
                    )
                }
                _ => ChatMessage::text(Role::User, text),
            },
            _ => ChatMessage::text(Role::User, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CombinedContent, MessageStatus, UserAccount};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FakePrompts {
        combination: Result<Option<CombinedContent>, String>,
    }

    #[async_trait]
    impl PromptResolver for FakePrompts {
        async fn prompt_content(&self, _id: &str) -> Result<Option<String>> {
            Ok(Some("Named prompt".to_string()))
        }

        async fn combined_content(&self, _id: &str, _user_id: &str) -> Result<Option<CombinedContent>> {
            self.combination.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    struct NoAttachments;

    #[async_trait]
    impl AttachmentStore for NoAttachments {
        async fn find_by_id(&self, _id: &str) -> Result<Option<Attachment>> {
            Ok(None)
        }
    }

    fn model() -> AvailableModel {
        AvailableModel {
            name: "m".to_string(),
            provider: "p".to_string(),
            credits_per_chat: 1,
            stream_enabled: true,
            image_upload_enabled: true,
            document_upload_enabled: true,
        }
    }

    async fn setup(
        prompt: PromptSource,
        context_length: i64,
        combination: Result<Option<CombinedContent>, String>,
    ) -> (Database, ContextAssembler, Conversation) {
        let db = Database::new_in_memory().unwrap();
        db.insert_user(&UserAccount::new("u1")).await.unwrap();
        let conv = Conversation {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            title: "New Chat".to_string(),
            model: "m".to_string(),
            prompt,
            context_length,
            temperature: 0.7,
            priority: 0,
            message_count: 0,
            total_tokens: 0,
            created_at: Utc::now(),
            last_message_at: None,
            cleared_at: None,
        };
        db.insert_conversation(&conv).await.unwrap();
        let assembler = ContextAssembler::new(
            db.clone(),
            Arc::new(FakePrompts { combination }),
            Arc::new(NoAttachments),
        );
        (db, assembler, conv)
    }

    async fn add_turns(db: &Database, count: usize) {
        let base = Utc::now() - chrono::Duration::minutes(5);
        for i in 0..count {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let mut msg = Message::new("c1", role, format!("turn {}", i));
            msg.status = MessageStatus::Completed;
            msg.created_at = base + chrono::Duration::seconds(i as i64);
            db.insert_message(&msg).await.unwrap();
        }
    }

    async fn current(db: &Database, text: &str) -> Message {
        let mut msg = Message::new("c1", Role::User, text);
        msg.status = MessageStatus::Completed;
        db.insert_message(&msg).await.unwrap();
        msg
    }

    #[tokio::test]
    async fn test_combination_suppresses_named_prompt() {
        let combined = CombinedContent {
            system_prompt: Some("Module rules".to_string()),
            normal_prompt: Some("Module facts".to_string()),
        };
        let (db, assembler, conv) = setup(
            PromptSource::ModuleCombination("c".to_string()),
            20,
            Ok(Some(combined)),
        )
        .await;
        let msg = current(&db, "Hi").await;

        let ctx = assembler.build(&conv, &model(), &msg, None).await.unwrap();
        assert_eq!(ctx.system_prompt.as_deref(), Some("Module rules"));
        assert_eq!(ctx.messages.len(), 3);
        assert_eq!(ctx.messages[0].content, "Module facts");
        assert_eq!(ctx.messages[1].content, CONTINUE_REPLY);
        assert_eq!(ctx.messages[2].content, "Hi");
        assert!(ctx.messages.iter().all(|m| m.content != "Named prompt"));
    }

    #[tokio::test]
    async fn test_combination_failure_does_not_abort() {
        let (db, assembler, conv) = setup(
            PromptSource::ModuleCombination("c".to_string()),
            20,
            Err("broken module".to_string()),
        )
        .await;
        let msg = current(&db, "Hi").await;

        let ctx = assembler.build(&conv, &model(), &msg, None).await.unwrap();
        assert!(ctx.system_prompt.is_none());
        assert_eq!(ctx.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_history_window_excludes_current_turn() {
        let (db, assembler, conv) = setup(PromptSource::Named("p".to_string()), 3, Ok(None)).await;
        add_turns(&db, 6).await;
        let msg = current(&db, "latest").await;

        let ctx = assembler.build(&conv, &model(), &msg, None).await.unwrap();
        assert_eq!(ctx.system_prompt.as_deref(), Some("Named prompt"));
        let contents: Vec<_> = ctx.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 3", "turn 4", "turn 5", "latest"]);
    }

    #[tokio::test]
    async fn test_zero_window_sends_no_history() {
        let (db, assembler, conv) =
            setup(PromptSource::Inline("Be terse.".to_string()), 0, Ok(None)).await;
        add_turns(&db, 4).await;
        let msg = current(&db, "latest").await;

        let ctx = assembler.build(&conv, &model(), &msg, None).await.unwrap();
        assert_eq!(ctx.system_prompt.as_deref(), Some("Be terse."));
        assert_eq!(ctx.messages.len(), 1);
    }

    #[test]
    fn test_attachments_shape_current_turn() {
        let image = Attachment {
            id: "f1".to_string(),
            user_id: "u1".to_string(),
            mime_type: "image/png".to_string(),
            filename: Some("cat.png".to_string()),
            url: "https://files.example/cat.png".to_string(),
            extracted_content: None,
        };
        let turn = ContextAssembler::current_turn(&model(), "What is this?", Some(&image));
        assert_eq!(turn.images.len(), 1);

        let doc = Attachment {
            mime_type: "application/pdf".to_string(),
            filename: Some("notes.pdf".to_string()),
            extracted_content: Some("Meeting at noon.".to_string()),
            ..image
        };
        let turn = ContextAssembler::current_turn(&model(), "Summarize", Some(&doc));
        assert!(turn.images.is_empty());
        assert_eq!(turn.content, "[File: notes.pdf]\nMeeting at noon.\n\nSummarize");
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
