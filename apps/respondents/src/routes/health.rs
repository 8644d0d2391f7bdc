use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::errors::EngineError;
use crate::state::AppState;

/// GET /health
/// Reports the service version and whether the store answers.
pub async fn health_handler(State(state): State<AppState>) -> Result<Json<Value>, EngineError> {
    let store = state.engine.store();
    store.ping().await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "respondents",
        "store": store.backend_name(),
    })))
}
