use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::config::AppConfig;
use crate::providers::ProviderRouter;
use crate::services::catalog::{
    AttachmentStore, CachedModelRegistry, ModelRegistry, PromptResolver, SqliteCatalog, UsageSink,
};
use crate::services::chat::ModelGateway;
use crate::services::context::ContextAssembler;
use crate::services::conversation::{ConversationService, MessageCache};
use crate::services::database::Database;
use crate::services::ledger::CreditLedger;
use crate::services::orchestrator::{Orchestrator, TurnEffects};
use crate::services::stream::{StreamRegistry, StreamSettings, StreamingCoordinator};

/// External collaborators the pipeline consults but never owns.
#[derive(Clone)]
pub struct Collaborators {
    pub models: Arc<dyn ModelRegistry>,
    pub prompts: Arc<dyn PromptResolver>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub usage: Arc<dyn UsageSink>,
}

impl Collaborators {
    /// Serve every collaborator from the application database.
    pub fn sqlite(db: &Database) -> Self {
        let catalog = Arc::new(SqliteCatalog::new(db.clone()));
        Self {
            models: catalog.clone(),
            prompts: catalog.clone(),
            attachments: catalog.clone(),
            usage: catalog,
        }
    }
}

/// Wired application: shared by every HTTP handler.
#[derive(Clone)]
pub struct App {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub ledger: CreditLedger,
    pub models: Arc<CachedModelRegistry>,
    pub conversations: Arc<ConversationService>,
    pub orchestrator: Arc<Orchestrator>,
    pub streams: StreamRegistry,
}

impl App {
    pub fn new(config: AppConfig, db: Database, providers: ProviderRouter) -> Self {
        let collaborators = Collaborators::sqlite(&db);
        Self::with_collaborators(config, db, providers, collaborators)
    }

    pub fn with_collaborators(
        config: AppConfig,
        db: Database,
        providers: ProviderRouter,
        collaborators: Collaborators,
    ) -> Self {
        let chat = config.chat.clone();
        let ledger = CreditLedger::new(db.clone());
        let streams = StreamRegistry::new();
        let messages = MessageCache::new(Duration::from_secs(config.cache.message_ttl_secs));
        let models = Arc::new(CachedModelRegistry::new(
            collaborators.models,
            Duration::from_secs(config.cache.model_ttl_secs),
        ));

        let gateway = Arc::new(ModelGateway::new(
            Arc::new(providers),
            chat.request_timeout(),
            chat.stream_idle_timeout(),
        ));
        let effects = Arc::new(TurnEffects::new(
            db.clone(),
            collaborators.usage,
            messages.clone(),
            chat.title_chars,
        ));
        let coordinator = Arc::new(StreamingCoordinator::new(
            db.clone(),
            gateway.clone(),
            streams.clone(),
            effects.clone(),
            StreamSettings {
                checkpoint_interval: chat.checkpoint_interval(),
                stopped_marker: chat.stopped_marker.clone(),
                client_buffer: chat.client_buffer,
            },
        ));
        let assembler = ContextAssembler::new(
            db.clone(),
            collaborators.prompts,
            collaborators.attachments.clone(),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            ledger.clone(),
            models.clone(),
            collaborators.attachments,
            assembler,
            gateway,
            coordinator,
            effects,
            chat.clone(),
        ));
        let conversations = Arc::new(ConversationService::new(
            db.clone(),
            models.clone(),
            streams.clone(),
            messages,
            chat,
        ));

        Self {
            config: Arc::new(config),
            db,
            ledger,
            models,
            conversations,
            orchestrator,
            streams,
        }
    }

    /// Fail and refund every `streaming` row left behind by a previous process.
    pub async fn recover_orphaned_streams(&self) -> Result<usize> {
        let recovered = self.db.recover_stale_streams(None, Utc::now()).await?;
        for stream in &recovered {
            tracing::warn!(
                message_id = %stream.message_id,
                conversation_id = %stream.conversation_id,
                refunded = stream.refunded,
                "Failed orphaned stream from previous run"
            );
        }
        Ok(recovered.len())
    }

    /// Stop in-flight streams and wait up to `grace` for them to settle. Each
    /// still runs its failure path and refunds; anything left over is picked up
    /// by the next startup recovery.
    pub async fn shutdown(&self, grace: Duration) {
        self.streams.cancel_all();
        let deadline = tokio::time::Instant::now() + grace;
        while !self.streams.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.streams.is_empty() {
            tracing::warn!(open = self.streams.len(), "Shutting down with unsettled streams");
        }
    }
}
