// ⚠️ Error Taxonomy
// Every failure the pipeline can surface, split by how the caller should react

use thiserror::Error;

/// Library-wide result alias
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Structured pipeline errors.
///
/// - `SchemaViolation`: one record is malformed, the record is rejected and
///   the batch carries on
/// - `ConstraintViolation`: a failed warehouse check, only ever reported (the
///   validity stage filters rows, checks log these, neither raises)
/// - `TransientIo`: a source or the warehouse is unavailable; retrying with
///   the same cursor window is safe
/// - `FatalConfiguration`: the run must stop before any write happens
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema violation in {entity}.{field}: {message}")]
    SchemaViolation {
        entity: String,
        field: String,
        message: String,
    },

    #[error("constraint {constraint} violated on {entity}: {message}")]
    ConstraintViolation {
        entity: String,
        constraint: String,
        message: String,
    },

    #[error("transient I/O failure ({context}): {message}")]
    TransientIo { context: String, message: String },

    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("invalid unit graph: {0}")]
    Scheduler(String),

    #[error("cancelled before {0}")]
    Cancelled(String),

    #[error("warehouse error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn schema(entity: &str, field: &str, message: impl Into<String>) -> Self {
        PipelineError::SchemaViolation {
            entity: entity.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn transient(context: &str, message: impl Into<String>) -> Self {
        PipelineError::TransientIo {
            context: context.to_string(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::FatalConfiguration(message.into())
    }

    /// Whether re-running the same window can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::TransientIo { .. } => true,
            PipelineError::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::FatalConfiguration(_))
    }
}
