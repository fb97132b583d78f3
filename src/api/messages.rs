use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use tokio::sync::mpsc;

use crate::app::App;
use crate::error::ChatResult;
use crate::models::{AuthContext, Message};
use crate::services::orchestrator::{SendMessage, TurnResponse};
use crate::services::stream::ChatEvent;

pub async fn list(
    State(app): State<App>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ChatResult<Json<Vec<Message>>> {
    Ok(Json(app.conversations.list_messages(&auth, &id).await?))
}

/// Submit a user message. Streams `init`/`chunk`/`complete`/`error` events when
/// both the model and the request allow it, otherwise answers with one JSON body.
pub async fn send(
    State(app): State<App>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<SendMessage>,
) -> ChatResult<Response> {
    match app.orchestrator.send_message(&auth, &id, body).await? {
        TurnResponse::Batched(turn) => Ok(Json(turn).into_response()),
        TurnResponse::Streaming(rx) => Ok(Sse::new(make_sse_stream(rx))
            .keep_alive(KeepAlive::default())
            .into_response()),
    }
}

fn make_sse_stream(
    mut rx: mpsc::Receiver<ChatEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.name()).data(data));
        }
        // Dropping rx on disconnect tells the coordinator to stop the turn.
    }
}

pub async fn delete(
    State(app): State<App>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ChatResult<StatusCode> {
    app.conversations.delete_message(&auth, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop(
    State(app): State<App>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ChatResult<Json<serde_json::Value>> {
    let stopped = app.conversations.stop(&auth, &id).await?;
    Ok(Json(serde_json::json!({ "stopped": stopped })))
}
