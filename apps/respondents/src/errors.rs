use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::consent::DataCategory;

/// Engine-level error type.
/// Every fallible engine operation returns `Result<T, EngineError>`; a failed
/// operation has persisted nothing.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Duplicate session token, duplicate user identifier, or a participation
    /// that can no longer be (re)started.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "Respondent {respondent_id} is already linked to user {linked_user_id}, refusing to link it to user {requested_user_id}"
    )]
    AlreadyLinked {
        respondent_id: Uuid,
        linked_user_id: Uuid,
        requested_user_id: Uuid,
    },

    #[error("Data integrity violation: {reason} (chain: {chain:?})")]
    DataIntegrity { reason: String, chain: Vec<Uuid> },

    #[error("Consent required for category '{category}'")]
    ConsentRequired { category: DataCategory },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn integrity(reason: impl Into<String>, chain: Vec<Uuid>) -> Self {
        let reason = reason.into();
        tracing::error!(?chain, "Merge chain integrity violation: {reason}");
        EngineError::DataIntegrity { reason, chain }
    }

    pub(crate) fn respondent_not_found(id: Uuid) -> Self {
        EngineError::NotFound(format!("Respondent {id} not found"))
    }

    /// Stable machine-readable code, also used as the `code` field of HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::AlreadyLinked { .. } => "IDENTITY_CONFLICT",
            EngineError::DataIntegrity { .. } => "DATA_INTEGRITY_ERROR",
            EngineError::ConsentRequired { .. } => "CONSENT_REQUIRED",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Database(_) => "DATABASE_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            EngineError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            EngineError::AlreadyLinked { .. } => (StatusCode::CONFLICT, self.to_string()),
            EngineError::ConsentRequired { .. } => (StatusCode::FORBIDDEN, self.to_string()),
            EngineError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            EngineError::DataIntegrity { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Respondent identity data is inconsistent".to_string(),
            ),
            EngineError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            EngineError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
