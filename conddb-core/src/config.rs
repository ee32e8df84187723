//! Access service configuration
//!
//! Options can be given in TOML (snake_case keys, or the historical option
//! names such as `ConnectionString` / `CacheHighLevel`) and overridden from
//! the environment.

use crate::{ConfigError, ConnectionString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration of one conditions-database access service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CondDbConfig {
    /// Service name, reported by `default_tags()`.
    #[serde(alias = "Name")]
    pub name: String,

    /// Required unless `no_db` is set.
    #[serde(alias = "ConnectionString")]
    pub connection_string: Option<String>,

    #[serde(alias = "DefaultTAG")]
    pub default_tag: String,

    #[serde(alias = "UseCache")]
    pub use_cache: bool,

    /// Eviction stops once the entry count is at or below this level.
    #[serde(alias = "CacheLowLevel")]
    pub cache_low_level: usize,

    /// Eviction starts once the entry count exceeds this level.
    #[serde(alias = "CacheHighLevel")]
    pub cache_high_level: usize,

    /// Run from the cache only; requires `use_cache`.
    #[serde(alias = "NoDB")]
    pub no_db: bool,

    #[serde(alias = "ReadOnly")]
    pub read_only: bool,

    #[serde(alias = "CheckTAGTrials")]
    pub check_tag_trials: u32,

    /// Delay between tag checks, in seconds.
    #[serde(alias = "CheckTAGTimeOut")]
    pub check_tag_timeout_secs: u64,

    /// Idle time before the connection is dropped, in seconds (0 = never).
    #[serde(alias = "ConnectionTimeOut")]
    pub connection_timeout_secs: u64,

    /// Condition whose latest `since` tells how up-to-date the replica is.
    #[serde(alias = "HeartBeatCondition")]
    pub heartbeat_condition: Option<String>,

    pub heartbeat_channel: u32,

    /// Width of the prefetch window on a cache miss (0 = disabled).
    #[serde(alias = "QueryGranularity")]
    pub query_granularity: u64,
}

impl Default for CondDbConfig {
    fn default() -> Self {
        Self {
            name: "CondDBAccessSvc".to_string(),
            connection_string: None,
            default_tag: crate::HEAD_TAG.to_string(),
            use_cache: true,
            cache_low_level: 10,
            cache_high_level: 100,
            no_db: false,
            read_only: true,
            check_tag_trials: 1,
            check_tag_timeout_secs: 60,
            connection_timeout_secs: 120,
            heartbeat_condition: None,
            heartbeat_channel: 0,
            query_granularity: 0,
        }
    }
}

impl CondDbConfig {
    /// Configuration for a database-backed service.
    pub fn with_connection(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            ..Self::default()
        }
    }

    /// Configuration for a cache-only (NoDB) service.
    pub fn cache_only() -> Self {
        Self {
            no_db: true,
            use_cache: true,
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Read a file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_path(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables.
    ///
    /// Environment variables:
    /// - `CONDDB_CONNECTION_STRING`: connection string
    /// - `CONDDB_DEFAULT_TAG`: default tag
    /// - `CONDDB_USE_CACHE`: "true" or "false"
    /// - `CONDDB_NO_DB`: "true" or "false"
    /// - `CONDDB_READ_ONLY`: "true" or "false"
    /// - `CONDDB_CONNECTION_TIMEOUT`: idle timeout in seconds
    ///
    /// Malformed numbers and booleans are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup, such as `std::env::var`.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("CONDDB_CONNECTION_STRING") {
            self.connection_string = Some(value);
        }
        if let Some(value) = lookup("CONDDB_DEFAULT_TAG") {
            self.default_tag = value;
        }
        if let Some(value) = parse_override(&lookup, "CONDDB_USE_CACHE", parse_bool) {
            self.use_cache = value;
        }
        if let Some(value) = parse_override(&lookup, "CONDDB_NO_DB", parse_bool) {
            self.no_db = value;
        }
        if let Some(value) = parse_override(&lookup, "CONDDB_READ_ONLY", parse_bool) {
            self.read_only = value;
        }
        if let Some(value) = parse_override(&lookup, "CONDDB_CONNECTION_TIMEOUT", |s| {
            s.trim().parse::<u64>().ok()
        }) {
            self.connection_timeout_secs = value;
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - cache_low_level <= cache_high_level, and cache_high_level > 0 when caching
    /// - no_db requires use_cache
    /// - connection_string present and well formed unless no_db
    /// - heartbeat_condition, if set, is an absolute path
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_low_level > self.cache_high_level {
            return Err(ConfigError::InvalidValue {
                field: "cache_low_level".to_string(),
                value: self.cache_low_level.to_string(),
                reason: format!(
                    "must not exceed cache_high_level ({})",
                    self.cache_high_level
                ),
            });
        }

        if self.use_cache && self.cache_high_level == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache_high_level".to_string(),
                value: "0".to_string(),
                reason: "cache_high_level must be positive when the cache is enabled".to_string(),
            });
        }

        if self.no_db && !self.use_cache {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "no_db".to_string(),
                option_b: "use_cache = false".to_string(),
            });
        }

        if !self.no_db {
            let raw = self
                .connection_string
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: "connection_string".to_string(),
                })?;
            ConnectionString::parse(raw)?;
        }

        if let Some(path) = &self.heartbeat_condition {
            crate::normalize_path(path).map_err(|e| ConfigError::InvalidValue {
                field: "heartbeat_condition".to_string(),
                value: path.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Parsed connection string, if one is configured.
    pub fn parsed_connection_string(&self) -> Result<Option<ConnectionString>, ConfigError> {
        self.connection_string
            .as_deref()
            .map(ConnectionString::parse)
            .transpose()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn check_tag_delay(&self) -> Duration {
        Duration::from_secs(self.check_tag_timeout_secs)
    }

    pub fn heartbeat_path(&self) -> Option<&str> {
        self.heartbeat_condition
            .as_deref()
            .filter(|p| !p.trim().is_empty())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_override<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring malformed configuration override");
    }
    parsed
}

// =============================================================================
// TESTS
// =============================================================================
