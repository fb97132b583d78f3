pub mod claude;
pub mod openai_compat;
pub mod router;
mod sse;
pub mod traits;
pub mod types;

pub use router::ProviderRouter;
pub use traits::AiProvider;
pub use types::{ChatMessage, ChatRequest, ChatResponse, ImageRef, ProviderError, StreamEvent};
