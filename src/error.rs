use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

use crate::providers::ProviderError;

/// Failures surfaced by the conversation pipeline.
///
/// Everything up to `InsufficientTokenQuota` is raised before credits are
/// reserved and never touches the ledger. `Provider` and `Persistence` may occur
/// after the reservation; the pipeline refunds before returning them.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Credits expired")]
    CreditsExpired,

    #[error("Token quota exhausted: {used} of {quota} used")]
    InsufficientTokenQuota { used: i64, quota: i64 },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ChatError::Authorization(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation_error",
            ChatError::Authorization(_) => "authorization_error",
            ChatError::NotFound(_) => "not_found",
            ChatError::InsufficientCredits { .. } | ChatError::CreditsExpired => {
                "insufficient_credits"
            }
            ChatError::InsufficientTokenQuota { .. } => "insufficient_token_quota",
            ChatError::Provider(e) => e.kind(),
            ChatError::Persistence(_) => "persistence_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Authorization(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InsufficientCredits { .. } | ChatError::CreditsExpired => {
                StatusCode::PAYMENT_REQUIRED
            }
            ChatError::InsufficientTokenQuota { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Provider(ProviderError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ChatError::Provider(_) => StatusCode::BAD_GATEWAY,
            ChatError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "code": self.code(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_status_codes() {
        assert_eq!(ChatError::validation("empty").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ChatError::forbidden("nope").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ChatError::NotFound("Conversation").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ChatError::InsufficientCredits {
                required: 10,
                available: 5
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ChatError::from(ProviderError::Rejected("policy".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ChatError::from(anyhow::anyhow!("disk full")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_persistence_message_keeps_cause() {
        let err = ChatError::from(anyhow::anyhow!("disk full").context("insert message"));
        assert_eq!(err.to_string(), "Persistence error: insert message: disk full");
    }
}
