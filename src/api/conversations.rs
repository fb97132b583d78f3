use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app::App;
use crate::error::ChatResult;
use crate::models::{AuthContext, Conversation};
use crate::services::conversation::{CreateConversation, UpdateConversation};

pub async fn create(
    State(app): State<App>,
    auth: AuthContext,
    Json(body): Json<CreateConversation>,
) -> ChatResult<(StatusCode, Json<Conversation>)> {
    let conversation = app.conversations.create(&auth, body).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn list(State(app): State<App>, auth: AuthContext) -> ChatResult<Json<Vec<Conversation>>> {
    Ok(Json(app.conversations.list(&auth).await?))
}

pub async fn update(
    State(app): State<App>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<UpdateConversation>,
) -> ChatResult<Json<Conversation>> {
    Ok(Json(app.conversations.update(&auth, &id, body).await?))
}

pub async fn clear(
    State(app): State<App>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ChatResult<Json<Conversation>> {
    Ok(Json(app.conversations.clear(&auth, &id).await?))
}

pub async fn delete(
    State(app): State<App>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ChatResult<StatusCode> {
    app.conversations.delete(&auth, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
