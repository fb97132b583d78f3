pub mod attachment;
pub mod catalog;
pub mod conversation;
pub mod ledger;
pub mod message;
pub mod user;

pub use attachment::{Attachment, AttachmentKind};
pub use catalog::{AvailableModel, CombinedContent};
pub use conversation::{Conversation, PromptSource};
pub use ledger::{CreditStats, LedgerEntry, LedgerLink, LedgerReason};
pub use message::{Artifact, Message, MessageStatus, Role};
pub use user::{AuthContext, UserAccount, UserRole};
