//! Engine configuration from `SHEETSYNC_*` environment variables

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::{BatchConfig, RetryPolicy};
use crate::util::is_http_url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where row locks and admission counters live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationBackend {
    /// Tables in the shared database file; every process cooperates
    Sqlite,
    /// Process memory; single instance only
    Memory,
}

impl CoordinationBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

impl FromStr for CoordinationBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::Invalid(
                "SHEETSYNC_COORDINATION must be 'sqlite' or 'memory'".to_string(),
            )),
        }
    }
}

#[derive(Clone)]
pub struct EngineConfig {
    /// `None` means the platform data directory chosen by the caller
    pub database_path: Option<PathBuf>,
    pub coordination: CoordinationBackend,
    pub cooldown: Duration,
    pub lock_ttl: Duration,
    pub header_row: u32,
    pub poll_interval: Duration,
    pub poll_batch_limit: usize,
    pub batch: BatchConfig,
    pub ingest_concurrency: usize,
    pub sheet_concurrency: usize,
    pub retry: RetryPolicy,
    pub rate_limit_window: Duration,
    pub sheet_writes_per_window: u64,
    pub store_writes_per_window: u64,
    pub sheet_api_url: Option<String>,
    pub sheet_api_token: Option<String>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("database_path", &self.database_path)
            .field("coordination", &self.coordination)
            .field("cooldown", &self.cooldown)
            .field("lock_ttl", &self.lock_ttl)
            .field("header_row", &self.header_row)
            .field("poll_interval", &self.poll_interval)
            .field("poll_batch_limit", &self.poll_batch_limit)
            .field("batch", &self.batch)
            .field("ingest_concurrency", &self.ingest_concurrency)
            .field("sheet_concurrency", &self.sheet_concurrency)
            .field("retry", &self.retry)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("sheet_writes_per_window", &self.sheet_writes_per_window)
            .field("store_writes_per_window", &self.store_writes_per_window)
            .field("sheet_api_url", &self.sheet_api_url)
            .field(
                "sheet_api_token",
                &self.sheet_api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            coordination: CoordinationBackend::Sqlite,
            cooldown: Duration::from_millis(5_000),
            lock_ttl: Duration::from_millis(30_000),
            header_row: 1,
            poll_interval: Duration::from_millis(1_000),
            poll_batch_limit: 100,
            batch: BatchConfig::default(),
            ingest_concurrency: 4,
            sheet_concurrency: 2,
            retry: RetryPolicy::default(),
            rate_limit_window: Duration::from_secs(60),
            sheet_writes_per_window: 50,
            store_writes_per_window: 600,
            sheet_api_url: None,
            sheet_api_token: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = optional_trimmed(&lookup, "SHEETSYNC_DATABASE_PATH").map(PathBuf::from);
        let coordination = optional_trimmed(&lookup, "SHEETSYNC_COORDINATION")
            .map_or(Ok(defaults.coordination), |value| value.parse())?;

        let cooldown_ms = bounded(&lookup, "SHEETSYNC_COOLDOWN_MS", 5_000_u64, 0, 600_000)?;
        let lock_ttl_ms = bounded(&lookup, "SHEETSYNC_LOCK_TTL_MS", 30_000_u64, 1_000, 600_000)?;
        let header_row = bounded(&lookup, "SHEETSYNC_HEADER_ROW", 1_u32, 1, u32::MAX)?;
        let poll_interval_ms =
            bounded(&lookup, "SHEETSYNC_POLL_INTERVAL_MS", 1_000_u64, 100, 60_000)?;
        let poll_batch_limit = bounded(&lookup, "SHEETSYNC_POLL_BATCH_LIMIT", 100_usize, 1, 1_000)?;
        let batch_max_size = bounded(&lookup, "SHEETSYNC_BATCH_MAX_SIZE", 50_usize, 1, 1_000)?;
        let batch_max_wait_ms =
            bounded(&lookup, "SHEETSYNC_BATCH_MAX_WAIT_MS", 5_000_u64, 100, 60_000)?;
        let ingest_concurrency = bounded(&lookup, "SHEETSYNC_INGEST_CONCURRENCY", 4_usize, 1, 64)?;
        let sheet_concurrency = bounded(&lookup, "SHEETSYNC_SHEET_CONCURRENCY", 2_usize, 1, 16)?;
        let max_attempts = bounded(&lookup, "SHEETSYNC_MAX_ATTEMPTS", 3_u32, 1, 10)?;
        let retry_base_ms =
            bounded(&lookup, "SHEETSYNC_RETRY_BASE_DELAY_MS", 5_000_u64, 10, 60_000)?;
        let window_secs = bounded(&lookup, "SHEETSYNC_RATE_LIMIT_WINDOW_SECS", 60_u64, 1, 3_600)?;
        let sheet_writes_per_window =
            bounded(&lookup, "SHEETSYNC_SHEET_WRITES_PER_WINDOW", 50_u64, 1, 10_000)?;
        let store_writes_per_window =
            bounded(&lookup, "SHEETSYNC_STORE_WRITES_PER_WINDOW", 600_u64, 1, 100_000)?;

        let sheet_api_url = optional_trimmed(&lookup, "SHEETSYNC_SHEET_API_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        if let Some(url) = sheet_api_url.as_deref() {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(
                    "SHEETSYNC_SHEET_API_URL must start with http:// or https://".to_string(),
                ));
            }
        }
        let sheet_api_token = optional_trimmed(&lookup, "SHEETSYNC_SHEET_API_TOKEN");

        Ok(Self {
            database_path,
            coordination,
            cooldown: Duration::from_millis(cooldown_ms),
            lock_ttl: Duration::from_millis(lock_ttl_ms),
            header_row,
            poll_interval: Duration::from_millis(poll_interval_ms),
            poll_batch_limit,
            batch: BatchConfig {
                max_size: batch_max_size,
                max_wait: Duration::from_millis(batch_max_wait_ms),
            },
            ingest_concurrency,
            sheet_concurrency,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(retry_base_ms),
                ..defaults.retry
            },
            rate_limit_window: Duration::from_secs(window_secs),
            sheet_writes_per_window,
            store_writes_per_window,
            sheet_api_url,
            sheet_api_token,
        })
    }

    /// Sheet endpoint; required to run the engine against a real sheet.
    pub fn require_sheet_api_url(&self) -> Result<&str, ConfigError> {
        self.sheet_api_url
            .as_deref()
            .ok_or(ConfigError::MissingVar("SHEETSYNC_SHEET_API_URL"))
    }
}

/// Parse `name` as a number in `[min, max]`, falling back to `default` when unset.
fn bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    min: T,
    max: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<T>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
