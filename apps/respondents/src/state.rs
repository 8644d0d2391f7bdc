use crate::config::Config;
use crate::engine::Engine;

/// Shared application state injected into route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub config: Config,
}
