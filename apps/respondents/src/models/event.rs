use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::context::EntryPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Authorized,
    Merged,
    SurveyStarted,
    SurveyProgressed,
    SurveyCompleted,
    SurveyAbandoned,
    ConsentGranted,
    ConsentDenied,
    LocationUpdated,
    SensorsUpdated,
    DataDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Authorized => "authorized",
            EventKind::Merged => "merged",
            EventKind::SurveyStarted => "survey_started",
            EventKind::SurveyProgressed => "survey_progressed",
            EventKind::SurveyCompleted => "survey_completed",
            EventKind::SurveyAbandoned => "survey_abandoned",
            EventKind::ConsentGranted => "consent_granted",
            EventKind::ConsentDenied => "consent_denied",
            EventKind::LocationUpdated => "location_updated",
            EventKind::SensorsUpdated => "sensors_updated",
            EventKind::DataDeleted => "data_deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "created" => EventKind::Created,
            "authorized" => EventKind::Authorized,
            "merged" => EventKind::Merged,
            "survey_started" => EventKind::SurveyStarted,
            "survey_progressed" => EventKind::SurveyProgressed,
            "survey_completed" => EventKind::SurveyCompleted,
            "survey_abandoned" => EventKind::SurveyAbandoned,
            "consent_granted" => EventKind::ConsentGranted,
            "consent_denied" => EventKind::ConsentDenied,
            "location_updated" => EventKind::LocationUpdated,
            "sensors_updated" => EventKind::SensorsUpdated,
            "data_deleted" => EventKind::DataDeleted,
            other => {
                return Err(EngineError::Validation(format!(
                    "Unknown event kind '{other}'"
                )))
            }
        };
        Ok(kind)
    }
}

/// Immutable journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondentEvent {
    pub id: Uuid,
    pub seq: i64,
    pub respondent_id: Uuid,
    pub kind: EventKind,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub source: Option<EntryPoint>,
}

impl RespondentEvent {
    pub fn ordering_key(&self) -> (DateTime<Utc>, i64) {
        (self.occurred_at, self.seq)
    }
}

#[derive(Debug, Clone)]
pub struct NewRespondentEvent {
    pub respondent_id: Uuid,
    pub kind: EventKind,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub source: Option<EntryPoint>,
}

impl NewRespondentEvent {
    pub fn sequenced(self, seq: i64) -> RespondentEvent {
        RespondentEvent {
            id: Uuid::new_v4(),
            seq,
            respondent_id: self.respondent_id,
            kind: self.kind,
            payload: self.payload,
            occurred_at: self.occurred_at,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            source: self.source,
        }
    }
}
