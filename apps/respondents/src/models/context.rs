use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Surface through which a request reached the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    Web,
    Pwa,
    TelegramWebapp,
    TelegramBot,
    Api,
    System,
}

impl EntryPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Web => "web",
            EntryPoint::Pwa => "pwa",
            EntryPoint::TelegramWebapp => "telegram_webapp",
            EntryPoint::TelegramBot => "telegram_bot",
            EntryPoint::Api => "api",
            EntryPoint::System => "system",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryPoint {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(EntryPoint::Web),
            "pwa" => Ok(EntryPoint::Pwa),
            "telegram_webapp" => Ok(EntryPoint::TelegramWebapp),
            "telegram_bot" => Ok(EntryPoint::TelegramBot),
            "api" => Ok(EntryPoint::Api),
            "system" => Ok(EntryPoint::System),
            other => Err(EngineError::Validation(format!(
                "Unknown entry point '{other}'"
            ))),
        }
    }
}

/// Request metadata stamped onto ledger and event rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub source: Option<EntryPoint>,
}

impl RequestContext {
    /// Context for writes the engine performs on its own behalf.
    pub fn system() -> Self {
        Self {
            source: Some(EntryPoint::System),
            ..Self::default()
        }
    }

    pub fn from_source(source: EntryPoint) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }
}
