//! Caller identity from trusted headers set by the fronting auth layer.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ChatError;
use crate::models::{AuthContext, UserRole};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const GROUP_ID_HEADER: &str = "x-group-id";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)
            .ok_or_else(|| ChatError::forbidden("Missing caller identity"))?;
        let role = match header(parts, USER_ROLE_HEADER) {
            Some(raw) => UserRole::from_str(raw)
                .ok_or_else(|| ChatError::forbidden(format!("Unknown role: {}", raw)))?,
            None => UserRole::User,
        };

        Ok(AuthContext {
            user_id: user_id.to_string(),
            role,
            group_id: header(parts, GROUP_ID_HEADER).map(str::to_string),
        })
    }
}
