pub mod auth;
pub mod conversations;
pub mod credits;
pub mod messages;

use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::app::App;

/// Build the HTTP router. Callers are authenticated upstream; see [`auth`].
pub fn router(app: App) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/conversations",
            post(conversations::create).get(conversations::list),
        )
        .route(
            "/api/conversations/:id",
            patch(conversations::update).delete(conversations::delete),
        )
        .route("/api/conversations/:id/clear", post(conversations::clear))
        .route(
            "/api/conversations/:id/messages",
            get(messages::list).post(messages::send),
        )
        .route("/api/messages/:id", delete(messages::delete))
        .route("/api/messages/:id/stop", post(messages::stop))
        .route("/api/credits", get(credits::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
