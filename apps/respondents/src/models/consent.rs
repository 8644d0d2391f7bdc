use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::context::EntryPoint;

const CUSTOM_PREFIX: &str = "custom:";

/// A class of personal data subject to opt-in.
///
/// Serialized as its string form: `location`, `device_info`, `custom:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DataCategory {
    Location,
    Name,
    Email,
    Phone,
    DeviceInfo,
    BrowserInfo,
    Analytics,
    Marketing,
    Custom(String),
}

impl DataCategory {
    pub fn custom(name: &str) -> Result<Self, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation(
                "Custom data category name must not be empty".to_string(),
            ));
        }
        Ok(DataCategory::Custom(name.to_string()))
    }

    /// Canonical form: custom names trimmed and non-empty, so the stored
    /// string parses back to an equal value.
    pub fn normalized(self) -> Result<Self, EngineError> {
        match self {
            DataCategory::Custom(name) => DataCategory::custom(&name),
            other => Ok(other),
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataCategory::Location => f.write_str("location"),
            DataCategory::Name => f.write_str("name"),
            DataCategory::Email => f.write_str("email"),
            DataCategory::Phone => f.write_str("phone"),
            DataCategory::DeviceInfo => f.write_str("device_info"),
            DataCategory::BrowserInfo => f.write_str("browser_info"),
            DataCategory::Analytics => f.write_str("analytics"),
            DataCategory::Marketing => f.write_str("marketing"),
            DataCategory::Custom(name) => write!(f, "{CUSTOM_PREFIX}{name}"),
        }
    }
}

impl FromStr for DataCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "location" => Ok(DataCategory::Location),
            "name" => Ok(DataCategory::Name),
            "email" => Ok(DataCategory::Email),
            "phone" => Ok(DataCategory::Phone),
            "device_info" => Ok(DataCategory::DeviceInfo),
            "browser_info" => Ok(DataCategory::BrowserInfo),
            "analytics" => Ok(DataCategory::Analytics),
            "marketing" => Ok(DataCategory::Marketing),
            other => match other.strip_prefix(CUSTOM_PREFIX) {
                Some(name) => DataCategory::custom(name),
                None => Err(EngineError::Validation(format!(
                    "Unknown data category '{other}'"
                ))),
            },
        }
    }
}

impl From<DataCategory> for String {
    fn from(category: DataCategory) -> Self {
        category.to_string()
    }
}

impl TryFrom<String> for DataCategory {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Derived answer to "may we use this category?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Granted,
    Denied,
    Unknown,
}

/// Immutable ledger entry. `seq` is assigned by the store on append and breaks
/// ties between records sharing a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: Uuid,
    pub seq: i64,
    pub respondent_id: Uuid,
    /// `None` = global consent, valid for every survey.
    pub survey_id: Option<Uuid>,
    pub category: DataCategory,
    pub granted: bool,
    pub recorded_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub source: Option<EntryPoint>,
    pub schema_version: String,
    pub details: Option<Value>,
}

impl ConsentRecord {
    pub fn ordering_key(&self) -> (DateTime<Utc>, i64) {
        (self.recorded_at, self.seq)
    }

    pub fn state(&self) -> ConsentState {
        if self.granted {
            ConsentState::Granted
        } else {
            ConsentState::Denied
        }
    }
}

/// A consent record before the store has sequenced it.
#[derive(Debug, Clone)]
pub struct NewConsentRecord {
    pub respondent_id: Uuid,
    pub survey_id: Option<Uuid>,
    pub category: DataCategory,
    pub granted: bool,
    pub recorded_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub source: Option<EntryPoint>,
    pub schema_version: String,
    pub details: Option<Value>,
}

impl NewConsentRecord {
    pub fn sequenced(self, seq: i64) -> ConsentRecord {
        ConsentRecord {
            id: Uuid::new_v4(),
            seq,
            respondent_id: self.respondent_id,
            survey_id: self.survey_id,
            category: self.category,
            granted: self.granted,
            recorded_at: self.recorded_at,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            source: self.source,
            schema_version: self.schema_version,
            details: self.details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_string_forms() {
        assert_eq!(DataCategory::DeviceInfo.to_string(), "device_info");
        assert_eq!(
            "custom:shoe_size".parse::<DataCategory>().unwrap(),
            DataCategory::Custom("shoe_size".to_string())
        );
        assert!("custom:  ".parse::<DataCategory>().is_err());
        assert!("blood_type".parse::<DataCategory>().is_err());
    }

    #[test]
    fn test_category_serializes_as_plain_string() {
        let json = serde_json::to_string(&DataCategory::Custom("pets".to_string())).unwrap();
        assert_eq!(json, "\"custom:pets\"");
        let back: DataCategory = serde_json::from_str("\"location\"").unwrap();
        assert_eq!(back, DataCategory::Location);
    }
}
