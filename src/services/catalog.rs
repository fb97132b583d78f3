use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{Attachment, AvailableModel, CombinedContent};
use crate::services::cache::TtlCache;
use crate::services::database::Database;

/// Models a caller may use, with tariff and capability flags.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn available_models(
        &self,
        user_id: &str,
        group_id: Option<&str>,
    ) -> Result<Vec<AvailableModel>>;
}

#[async_trait]
pub trait PromptResolver: Send + Sync {
    async fn prompt_content(&self, id: &str) -> Result<Option<String>>;

    async fn combined_content(&self, id: &str, user_id: &str) -> Result<Option<CombinedContent>>;
}

/// Read-only view of uploaded files.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Attachment>>;

    async fn check_ownership(&self, id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .find_by_id(id)
            .await?
            .is_some_and(|a| a.user_id == user_id))
    }
}

/// Daily usage counters. Callers treat failures as non-fatal.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, user_id: &str, model: &str, messages: i64, tokens: i64) -> Result<()>;
}

/// All four collaborators served from the application database.
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    db: Database,
}

impl SqliteCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ModelRegistry for SqliteCatalog {
    async fn available_models(
        &self,
        _user_id: &str,
        group_id: Option<&str>,
    ) -> Result<Vec<AvailableModel>> {
        self.db.list_available_models(group_id).await
    }
}

#[async_trait]
impl PromptResolver for SqliteCatalog {
    async fn prompt_content(&self, id: &str) -> Result<Option<String>> {
        self.db.get_prompt_content(id).await
    }

    async fn combined_content(&self, id: &str, user_id: &str) -> Result<Option<CombinedContent>> {
        self.db.get_combined_content(id, user_id).await
    }
}

#[async_trait]
impl AttachmentStore for SqliteCatalog {
    async fn find_by_id(&self, id: &str) -> Result<Option<Attachment>> {
        self.db.get_attachment(id).await
    }
}

#[async_trait]
impl UsageSink for SqliteCatalog {
    async fn record(&self, user_id: &str, model: &str, messages: i64, tokens: i64) -> Result<()> {
        self.db
            .record_usage(Utc::now().date_naive(), user_id, model, messages, tokens)
            .await
    }
}

/// Short-lived cache in front of a [`ModelRegistry`], keyed by `(user, group)`.
pub struct CachedModelRegistry {
    inner: Arc<dyn ModelRegistry>,
    cache: TtlCache<(String, Option<String>), Vec<AvailableModel>>,
}

impl CachedModelRegistry {
    pub fn new(inner: Arc<dyn ModelRegistry>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl),
        }
    }

    pub async fn available_models(
        &self,
        user_id: &str,
        group_id: Option<&str>,
    ) -> Result<Vec<AvailableModel>> {
        let key = (user_id.to_string(), group_id.map(|g| g.to_string()));
        self.cache
            .get_or_load(key, || self.inner.available_models(user_id, group_id))
            .await
    }

    pub async fn find(
        &self,
        user_id: &str,
        group_id: Option<&str>,
        name: &str,
    ) -> Result<Option<AvailableModel>> {
        Ok(self
            .available_models(user_id, group_id)
            .await?
            .into_iter()
            .find(|m| m.name == name))
    }

    pub async fn invalidate_all(&self) {
        self.cache.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn seed_catalog(db: &Database) {
        let conn = db.conn_ref().lock().unwrap();
        conn.execute_batch(
            "INSERT INTO ai_models (name, provider, credits_per_chat, stream_enabled, image_upload_enabled, document_upload_enabled, is_active, sort_order)
             VALUES ('open-model', 'openai', 10, 1, 1, 0, 1, 0),
                    ('team-model', 'openai', 5, 0, 0, 1, 1, 1),
                    ('retired', 'openai', 1, 1, 0, 0, 0, 2);
             INSERT INTO model_group_access (model_name, group_id) VALUES ('team-model', 'g1');

             INSERT INTO system_prompts (id, content) VALUES ('p1', 'You are a pirate.');
             INSERT INTO prompt_modules (id, user_id, kind, content) VALUES
                ('s1', NULL, 'system', 'Rule one.'),
                ('s2', NULL, 'system', 'Rule two.'),
                ('n1', NULL, 'normal', 'Background facts.');
             INSERT INTO module_combinations (id, user_id, name) VALUES ('c1', 'u1', 'Mine');
             INSERT INTO module_combination_items (combination_id, module_id, position) VALUES
                ('c1', 's2', 2), ('c1', 's1', 1), ('c1', 'n1', 3);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO attachments (id, user_id, mime_type, filename, url, extracted_content, created_at)
             VALUES ('f1', 'u1', 'image/png', 'cat.png', 'https://files.example/cat.png', NULL, ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_group_access_filters_models() {
        let db = Database::new_in_memory().unwrap();
        seed_catalog(&db);
        let catalog = SqliteCatalog::new(db);

        let public: Vec<_> = catalog
            .available_models("u1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(public, vec!["open-model"]);

        let team = catalog.available_models("u1", Some("g1")).await.unwrap();
        assert_eq!(team.len(), 2);
        assert!(!team[1].stream_enabled);
    }

    #[tokio::test]
    async fn test_combination_joins_fragments_in_order() {
        let db = Database::new_in_memory().unwrap();
        seed_catalog(&db);
        let catalog = SqliteCatalog::new(db);

        let combined = catalog.combined_content("c1", "u1").await.unwrap().unwrap();
        assert_eq!(combined.system_prompt.as_deref(), Some("Rule one.\n\nRule two."));
        assert_eq!(combined.normal_prompt.as_deref(), Some("Background facts."));

        // Another user's combination is invisible
        assert!(catalog.combined_content("c1", "u2").await.unwrap().is_none());
        assert_eq!(
            catalog.prompt_content("p1").await.unwrap().as_deref(),
            Some("You are a pirate.")
        );
    }

    #[tokio::test]
    async fn test_attachment_ownership() {
        let db = Database::new_in_memory().unwrap();
        seed_catalog(&db);
        let catalog = SqliteCatalog::new(db);

        assert!(catalog.check_ownership("f1", "u1").await.unwrap());
        assert!(!catalog.check_ownership("f1", "u2").await.unwrap());
        assert!(!catalog.check_ownership("missing", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_counters_accumulate() {
        let db = Database::new_in_memory().unwrap();
        let catalog = SqliteCatalog::new(db.clone());
        catalog.record("u1", "open-model", 2, 30).await.unwrap();
        catalog.record("u1", "open-model", 2, 12).await.unwrap();

        let conn = db.conn_ref().lock().unwrap();
        let (messages, tokens): (i64, i64) = conn
            .query_row(
                "SELECT messages, tokens FROM usage_daily WHERE user_id = 'u1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((messages, tokens), (4, 42));

        let requests: i64 = conn
            .query_row(
                "SELECT requests FROM model_usage_daily WHERE model = 'open-model'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(requests, 2);
    }
}
