pub mod health;

use axum::{routing::get, Router};

use crate::state::AppState;

/// The engine is consumed as a library; the service only exposes liveness.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .with_state(state)
}
