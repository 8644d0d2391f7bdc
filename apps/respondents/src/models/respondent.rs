use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::context::EntryPoint;

/// Context collected on every contact without asking for consent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplicitAttributes {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// e.g. `{"name": "Chrome", "version": "120.0", "language": "ru"}`
    pub browser_info: Option<Value>,
    /// e.g. `{"type": "mobile", "os": "iOS", "screen": {"width": 390, "height": 844}}`
    pub device_info: Option<Value>,
    /// IP-derived country/city/timezone.
    pub geo_info: Option<Value>,
    pub referrer_info: Option<Value>,
    pub telegram_data: Option<Value>,
    pub entry_point: Option<EntryPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreciseLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: Option<f64>,
}

/// Attributes that may only be stored while the matching consent is granted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionedAttributes {
    pub precise_location: Option<PreciseLocation>,
    pub device_sensors: Option<Value>,
}

impl PermissionedAttributes {
    pub fn is_empty(&self) -> bool {
        self.precise_location.is_none() && self.device_sensors.is_none()
    }
}

/// A participation identity, anonymous or linked to a user.
///
/// `is_merged` implies `merged_into_id` is set and points at a non-merged
/// respondent. Merged respondents are never removed; they act as redirects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Respondent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub session_token: String,
    pub fingerprint: Option<String>,
    pub explicit: ExplicitAttributes,
    pub permissioned: PermissionedAttributes,
    pub is_anonymous: bool,
    pub is_active: bool,
    pub is_merged: bool,
    pub merged_into_id: Option<Uuid>,
    pub first_seen_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Respondent {
    pub fn anonymous(
        session_token: String,
        fingerprint: Option<String>,
        explicit: ExplicitAttributes,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            session_token,
            fingerprint,
            explicit,
            permissioned: PermissionedAttributes::default(),
            is_anonymous: true,
            is_active: true,
            is_merged: false,
            merged_into_id: None,
            first_seen_at: now,
            last_activity_at: now,
            is_deleted: false,
            deleted_at: None,
        }
    }

    pub fn is_canonical(&self) -> bool {
        !self.is_merged
    }
}
