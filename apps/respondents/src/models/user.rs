use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Authenticated identity. At least one of the identifiers is always set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub username: Option<String>,
    pub telegram_chat_id: Option<i64>,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_usable(&self) -> bool {
        self.is_active && !self.is_deleted
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    pub email: Option<String>,
    pub username: Option<String>,
    pub telegram_chat_id: Option<i64>,
}
