//! Engine configuration from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | unset: in-memory driver |
//! | `REDIS_URL` | unset: in-memory document store |
//! | `EVENTSTORAGE_TENANT_ID` | nil tenant |
//! | `EVENTSTORAGE_CATCH_UP_INTERVAL_MS` | 1000 |
//! | `EVENTSTORAGE_CATCH_UP_BATCH_SIZE` | 500 |
//! | `EVENTSTORAGE_MAX_COMMIT_ATTEMPTS` | 3 |
//! | `EVENTSTORAGE_DB_MAX_CONNECTIONS` | 10 |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use eventstorage_core::TenantId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {variable}: '{value}' ({reason})")]
    Invalid {
        variable: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub tenant_id: TenantId,
    pub catch_up_interval: Duration,
    pub catch_up_batch_size: u64,
    pub max_commit_attempts: u32,
    pub db_max_connections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            tenant_id: TenantId::unscoped(),
            catch_up_interval: Duration::from_millis(1000),
            catch_up_batch_size: 500,
            max_commit_attempts: 3,
            db_max_connections: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let tenant_id = match get("EVENTSTORAGE_TENANT_ID") {
            Some(raw) => Uuid::parse_str(raw.trim())
                .map(TenantId::from_uuid)
                .map_err(|e| invalid("EVENTSTORAGE_TENANT_ID", &raw, e))?,
            None => defaults.tenant_id,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            tenant_id,
            catch_up_interval: Duration::from_millis(parse_positive(
                "EVENTSTORAGE_CATCH_UP_INTERVAL_MS",
                get("EVENTSTORAGE_CATCH_UP_INTERVAL_MS"),
                1000,
            )?),
            catch_up_batch_size: parse_positive(
                "EVENTSTORAGE_CATCH_UP_BATCH_SIZE",
                get("EVENTSTORAGE_CATCH_UP_BATCH_SIZE"),
                defaults.catch_up_batch_size,
            )?,
            max_commit_attempts: parse_positive(
                "EVENTSTORAGE_MAX_COMMIT_ATTEMPTS",
                get("EVENTSTORAGE_MAX_COMMIT_ATTEMPTS"),
                defaults.max_commit_attempts,
            )?,
            db_max_connections: parse_positive(
                "EVENTSTORAGE_DB_MAX_CONNECTIONS",
                get("EVENTSTORAGE_DB_MAX_CONNECTIONS"),
                defaults.db_max_connections,
            )?,
        })
    }
}

fn parse_positive<T>(variable: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: core::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value = raw.trim().parse::<T>().map_err(|e| invalid(variable, &raw, e))?;
    if value <= T::default() {
        return Err(invalid(variable, &raw, "must be greater than zero"));
    }
    Ok(value)
}

fn invalid(variable: &'static str, value: &str, reason: impl core::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        variable,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
