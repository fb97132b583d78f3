use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(UserRole::User),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

/// Verified caller identity handed over by the upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub role: UserRole,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub role: UserRole,
    pub group_id: Option<String>,
    /// Cached running sum of the user's ledger entries.
    pub credits: i64,
    pub credits_expire_at: Option<DateTime<Utc>>,
    /// `None` means unlimited.
    pub token_quota: Option<i64>,
    pub tokens_used: i64,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: UserRole::User,
            group_id: None,
            credits: 0,
            credits_expire_at: None,
            token_quota: None,
            tokens_used: 0,
            created_at: Utc::now(),
        }
    }

    pub fn credits_expired(&self, now: DateTime<Utc>) -> bool {
        self.credits_expire_at.is_some_and(|at| at <= now)
    }

    pub fn token_quota_exhausted(&self) -> bool {
        self.token_quota.is_some_and(|quota| self.tokens_used >= quota)
    }
}
