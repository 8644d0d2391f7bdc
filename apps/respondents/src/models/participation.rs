use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::context::EntryPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationStatus {
    Started,
    InProgress,
    Completed,
    Abandoned,
}

impl ParticipationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipationStatus::Started => "started",
            ParticipationStatus::InProgress => "in_progress",
            ParticipationStatus::Completed => "completed",
            ParticipationStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ParticipationStatus::Completed | ParticipationStatus::Abandoned
        )
    }
}

impl fmt::Display for ParticipationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(ParticipationStatus::Started),
            "in_progress" => Ok(ParticipationStatus::InProgress),
            "completed" => Ok(ParticipationStatus::Completed),
            "abandoned" => Ok(ParticipationStatus::Abandoned),
            other => Err(EngineError::Validation(format!(
                "Unknown participation status '{other}'"
            ))),
        }
    }
}

/// Progress of one respondent through one survey.
/// `answered_count <= total_questions`, and `Completed` implies they are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyParticipation {
    pub id: Uuid,
    pub respondent_id: Uuid,
    pub survey_id: Uuid,
    pub status: ParticipationStatus,
    pub answered_count: u32,
    pub total_questions: u32,
    pub progress_percentage: f64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub time_spent_seconds: u64,
    pub completion_source: Option<EntryPoint>,
}

/// answered / total as a percentage, clamped to [0, 100].
pub fn progress_percentage(answered: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(answered) / f64::from(total) * 100.0).clamp(0.0, 100.0)
}
