//! Error types for the recorder

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for recorder operations
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Result type for admin service calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised while loading or validating `recorder:` configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The database URL could not be understood
    #[error("invalid database URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The URL names a dialect the recorder cannot talk to
    #[error("unsupported database dialect '{dialect}'")]
    UnsupportedDialect { dialect: String },

    /// In-memory databases lose everything on restart
    #[error("in-memory database URL '{url}' is not supported, the recorder requires durable storage")]
    InMemoryDatabase { url: String },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Errors raised by the recording engine
///
/// These never reach producers: the writer thread logs them and keeps
/// going. They surface from setup, admin calls and executor jobs.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A pooled connection was requested from the event loop
    #[error("database connections must not be opened from the event loop thread")]
    EventLoopAccess,

    #[error("recorder is not running")]
    NotRunning,

    #[error("timed out waiting for the database to be locked")]
    LockTimeout,

    #[error("schema error: {0}")]
    Schema(String),

    #[error("database integrity check failed: {0}")]
    Integrity(String),

    #[error("invalid statistic '{statistic_id}': {reason}")]
    InvalidStatistic {
        statistic_id: String,
        reason: String,
    },

    #[error("executor job failed: {0}")]
    Executor(#[from] tokio::task::JoinError),
}

impl RecorderError {
    /// SQLite reported that the database file is damaged
    pub fn is_corruption(&self) -> bool {
        match self {
            RecorderError::Sqlite(err) => is_corruption(err),
            RecorderError::Integrity(_) => true,
            _ => false,
        }
    }

    /// Busy/locked class errors that are worth retrying after a short sleep
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecorderError::Sqlite(err) if is_retryable(err))
    }
}

/// Whether a raw SQLite error means the file is corrupt
pub fn is_corruption(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Whether a raw SQLite error is transient
pub fn is_retryable(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Errors returned to admin service callers
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid data for service '{service}': {reason}")]
    InvalidData { service: String, reason: String },

    #[error("unknown recorder service '{0}'")]
    UnknownService(String),

    #[error("recorder is not running")]
    NotRunning,
}
