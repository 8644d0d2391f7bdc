use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::consent::DataCategory;

pub const DEFAULT_RETENTION_DAYS: i32 = 365;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRequirement {
    pub category: DataCategory,
    pub requested: bool,
    pub mandatory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationPrecision {
    Exact,
    City,
    Country,
}

/// Data policy declared by a survey. One per survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyDataRequirement {
    pub survey_id: Uuid,
    /// Declaration order is the order categories are reported in evaluations.
    pub categories: Vec<CategoryRequirement>,
    pub location_precision: Option<LocationPrecision>,
    pub data_collection_notice: Option<String>,
    pub privacy_policy_url: Option<String>,
    pub terms_of_service_url: Option<String>,
    pub data_retention_days: i32,
    pub allow_data_export: bool,
    pub allow_data_deletion: bool,
    pub updated_at: DateTime<Utc>,
}

impl SurveyDataRequirement {
    pub fn new(survey_id: Uuid) -> Self {
        Self {
            survey_id,
            categories: Vec::new(),
            location_precision: None,
            data_collection_notice: None,
            privacy_policy_url: None,
            terms_of_service_url: None,
            data_retention_days: DEFAULT_RETENTION_DAYS,
            allow_data_export: true,
            allow_data_deletion: true,
            updated_at: Utc::now(),
        }
    }

    pub fn require(self, category: DataCategory) -> Self {
        self.with(category, true, true)
    }

    pub fn request(self, category: DataCategory) -> Self {
        self.with(category, true, false)
    }

    pub fn with(mut self, category: DataCategory, requested: bool, mandatory: bool) -> Self {
        self.categories.push(CategoryRequirement {
            category,
            requested,
            mandatory,
        });
        self
    }

    pub fn requested(&self) -> impl Iterator<Item = &CategoryRequirement> {
        self.categories.iter().filter(|c| c.requested)
    }
}

/// Outcome of gating a respondent against a survey's data policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub can_proceed: bool,
    pub missing_required: Vec<DataCategory>,
    pub missing_optional: Vec<DataCategory>,
    pub satisfied: Vec<DataCategory>,
}

impl Evaluation {
    pub fn unrestricted() -> Self {
        Self {
            can_proceed: true,
            missing_required: Vec::new(),
            missing_optional: Vec::new(),
            satisfied: Vec::new(),
        }
    }
}
