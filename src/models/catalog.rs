use serde::{Deserialize, Serialize};

use super::attachment::AttachmentKind;

/// A model as seen by one caller: tariff and capability flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvailableModel {
    pub name: String,
    /// Id of the configured provider entry serving this model.
    pub provider: String,
    pub credits_per_chat: i64,
    pub stream_enabled: bool,
    pub image_upload_enabled: bool,
    pub document_upload_enabled: bool,
}

impl AvailableModel {
    pub fn supports(&self, kind: AttachmentKind) -> bool {
        match kind {
            AttachmentKind::Image => self.image_upload_enabled,
            AttachmentKind::Document => self.document_upload_enabled,
        }
    }
}

/// Content resolved from a module combination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinedContent {
    pub system_prompt: Option<String>,
    pub normal_prompt: Option<String>,
}
