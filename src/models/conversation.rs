use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_CONTEXT_LENGTH: i64 = 1000;

/// Where the system prompt of a conversation comes from. The three sources are
/// mutually exclusive; picking one clears the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PromptSource {
    None,
    ModuleCombination(String),
    Named(String),
    Inline(String),
}

impl PromptSource {
    pub fn from_columns(
        prompt_id: Option<String>,
        combination_id: Option<String>,
        inline: Option<String>,
    ) -> Self {
        if let Some(id) = combination_id.filter(|s| !s.is_empty()) {
            PromptSource::ModuleCombination(id)
        } else if let Some(id) = prompt_id.filter(|s| !s.is_empty()) {
            PromptSource::Named(id)
        } else if let Some(text) = inline.filter(|s| !s.trim().is_empty()) {
            PromptSource::Inline(text)
        } else {
            PromptSource::None
        }
    }

    /// Split into `(system_prompt_id, module_combination_id, system_prompt)` columns.
    pub fn to_columns(&self) -> (Option<String>, Option<String>, Option<String>) {
        match self {
            PromptSource::None => (None, None, None),
            PromptSource::ModuleCombination(id) => (None, Some(id.clone()), None),
            PromptSource::Named(id) => (Some(id.clone()), None, None),
            PromptSource::Inline(text) => (None, None, Some(text.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub model: String,
    pub prompt: PromptSource,
    pub context_length: i64,
    pub temperature: f32,
    pub priority: i64,
    pub message_count: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Read watermark: messages created at or before this instant are hidden.
    pub cleared_at: Option<DateTime<Utc>>,
}

pub fn clamp_temperature(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
