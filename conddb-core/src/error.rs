//! Error types for conditions-database operations

use crate::{ChannelId, ValidityKey};
use thiserror::Error;

/// Storage layer errors (backend store and cache bookkeeping).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("No object for {path} channel {channel} at {when}")]
    NotFound {
        path: String,
        channel: ChannelId,
        when: ValidityKey,
    },

    #[error("Node not found: {path}")]
    NodeNotFound { path: String },

    #[error("Wrong node type for {path}: expected a {expected}")]
    WrongNodeType { path: String, expected: String },

    #[error("Node already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Out-of-order insert into {path}: since {since} is not after the latest object at {latest}")]
    OutOfOrder {
        path: String,
        since: ValidityKey,
        latest: ValidityKey,
    },

    #[error("Unknown channel name {name} in {path}")]
    UnknownChannel { path: String, name: String },

    #[error("Cache is disabled")]
    CacheDisabled,

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Backend failure: {reason}")]
    Backend { reason: String },
}

/// Errors establishing or using the backend connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Failed to open connection to {target}: {reason}")]
    OpenFailed { target: String, reason: String },

    #[error("Connection is not open")]
    NotOpen,

    #[error("No database configured (NoDB mode)")]
    NoDatabase,

    #[error("Unsupported backend: {backend}")]
    UnsupportedBackend { backend: String },
}

/// Tag lookup and tagging errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("Tag {tag} not found after {trials} trial(s)")]
    NotFound { tag: String, trials: u32 },

    #[error("Tag {tag} cannot be resolved for {path}")]
    Unresolved { tag: String, path: String },

    #[error("Tag {tag} already exists on {path}")]
    AlreadyExists { tag: String, path: String },

    #[error("Tag name {tag} is reserved")]
    Reserved { tag: String },
}

/// Validation errors raised before a request reaches the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid interval of validity [{since}, {until})")]
    InvalidIov {
        since: ValidityKey,
        until: ValidityKey,
    },

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Operation {operation} refused: service is read-only")]
    ReadOnly { operation: String },

    #[error("Database not up-to-date: latest known update is at {latest}, requested {requested}")]
    StaleReplica {
        requested: ValidityKey,
        latest: ValidityKey,
    },

    #[error("Service is not initialized")]
    NotInitialized,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all conditions-database errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CondDbError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Tag error: {0}")]
    Tag(#[from] TagError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CondDbError {
    /// True for "no data here" outcomes a caller may legitimately recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CondDbError::Storage(StorageError::NotFound { .. })
                | CondDbError::Storage(StorageError::NodeNotFound { .. })
        )
    }

    /// True when the backend could not be reached.
    pub fn is_connection(&self) -> bool {
        matches!(self, CondDbError::Connection(_))
    }
}

/// Result type alias for conditions-database operations.
pub type CondDbResult<T> = Result<T, CondDbError>;

// =============================================================================
// TESTS
// =============================================================================
