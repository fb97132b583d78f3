use axum::extract::State;
use axum::Json;

use crate::app::App;
use crate::error::ChatResult;
use crate::models::{AuthContext, CreditStats};

pub async fn stats(State(app): State<App>, auth: AuthContext) -> ChatResult<Json<CreditStats>> {
    Ok(Json(app.ledger.stats(&auth.user_id).await?))
}
