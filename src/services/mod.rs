pub mod cache;
pub mod catalog;
pub mod chat;
pub mod context;
pub mod conversation;
pub mod database;
pub mod ledger;
pub mod orchestrator;
pub mod stream;

pub use cache::TtlCache;
pub use catalog::{
    AttachmentStore, CachedModelRegistry, ModelRegistry, PromptResolver, SqliteCatalog, UsageSink,
};
pub use chat::ModelGateway;
pub use context::ContextAssembler;
pub use conversation::ConversationService;
pub use database::Database;
pub use ledger::{CreditLedger, Reservation};
pub use orchestrator::{Orchestrator, TurnEffects, TurnResponse};
pub use stream::{ChatEvent, StreamRegistry, StreamingCoordinator};
