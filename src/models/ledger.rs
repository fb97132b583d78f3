use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Grant,
    ChatReserve,
    ChatRefund,
    StaleStreamRefund,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::Grant => "grant",
            LedgerReason::ChatReserve => "chat_reserve",
            LedgerReason::ChatRefund => "chat_refund",
            LedgerReason::StaleStreamRefund => "stale_stream_refund",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "grant" => Some(LedgerReason::Grant),
            "chat_reserve" => Some(LedgerReason::ChatReserve),
            "chat_refund" => Some(LedgerReason::ChatRefund),
            "stale_stream_refund" => Some(LedgerReason::StaleStreamRefund),
            _ => None,
        }
    }

    pub fn is_refund(&self) -> bool {
        matches!(self, LedgerReason::ChatRefund | LedgerReason::StaleStreamRefund)
    }
}

/// One append-only row of the credit ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: LedgerReason,
    pub model: Option<String>,
    pub conversation_id: Option<String>,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Linking fields written alongside a ledger delta.
#[derive(Debug, Clone, Default)]
pub struct LedgerLink {
    pub model: Option<String>,
    pub conversation_id: Option<String>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditStats {
    pub quota: i64,
    pub used: i64,
    pub remaining: i64,
    pub expired: bool,
    pub expires_at: Option<DateTime<Utc>>,
}
