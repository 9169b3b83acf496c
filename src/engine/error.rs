//! Engine-specific error types.

use thiserror::Error;

use crate::error::BridgeError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised inside the embedded engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown column `{column}` on {entity}")]
    UnknownColumn { entity: String, column: String },

    #[error("invalid value for {entity}.{column}: {reason}")]
    InvalidValue {
        entity: String,
        column: String,
        reason: String,
    },

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("engine task failed: {0}")]
    Task(String),
}

impl EngineError {
    pub fn unknown_column(entity: &str, column: &str) -> Self {
        Self::UnknownColumn {
            entity: entity.to_string(),
            column: column.to_string(),
        }
    }

    pub fn invalid_value(entity: &str, column: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            entity: entity.to_string(),
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        BridgeError::EngineExecution(err.to_string())
    }
}
