use thiserror::Error;

/// Main error type for riskprop
#[derive(Error, Debug)]
pub enum RiskError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse errors (sanctions list, stored labels)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage write failures that are not plain SQLite errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A batch write kept failing after every retry
    #[error("Storage write '{operation}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        last_error: String,
    },

    /// Too many records were skipped for the run to be trusted
    #[error("Skipped {skipped} records, above the configured maximum of {max}")]
    SkipThresholdExceeded { skipped: u64, max: u64 },

    /// A blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl RiskError {
    /// Whether a failed batch write is worth retrying: only lock contention is.
    pub fn is_retryable(&self) -> bool {
        match self {
            RiskError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Convenient Result type using RiskError
pub type Result<T> = std::result::Result<T, RiskError>;
