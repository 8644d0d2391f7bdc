use anyhow::{bail, Context, Result};

pub const DEFAULT_MAX_MERGE_DEPTH: usize = 10;
pub const DEFAULT_CONSENT_SCHEMA_VERSION: &str = "1.0";

/// Knobs the engine itself needs. Independent of the environment so the
/// engine can be embedded as a library.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of `merged_into` hops followed before resolution fails.
    pub max_merge_depth: usize,
    /// Stamped onto every consent record.
    pub consent_schema_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_merge_depth: DEFAULT_MAX_MERGE_DEPTH,
            consent_schema_version: DEFAULT_CONSENT_SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Service configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    /// Always set when `store_backend` is `Postgres`.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub port: u16,
    pub rust_log: String,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{other}'"),
        };

        let database_url = lookup("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            bail!("Required environment variable 'DATABASE_URL' is not set");
        }

        let max_merge_depth = parse_or(&lookup, "MERGE_MAX_DEPTH", DEFAULT_MAX_MERGE_DEPTH)?;
        if max_merge_depth == 0 {
            bail!("MERGE_MAX_DEPTH must be at least 1");
        }

        Ok(Config {
            store_backend,
            database_url,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            port: parse_or(&lookup, "PORT", 8080)?,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            engine: EngineConfig {
                max_merge_depth,
                consent_schema_version: lookup("CONSENT_SCHEMA_VERSION")
                    .unwrap_or_else(|| DEFAULT_CONSENT_SCHEMA_VERSION.to_string()),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}
