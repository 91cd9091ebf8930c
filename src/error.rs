//! Global error type.
//!
//! One variant per failure kind the engine distinguishes. Executors and the
//! scheduler match on the variant to decide how a failure propagates, e.g.
//! network errors become `error`-type change log entries while validation
//! errors surface to the caller untouched.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// DNS, connect, TLS, or read failure while talking to the watched
    /// endpoint. HTTP status codes are never an error.
    #[error("network error: {0}")]
    Network(String),

    /// A run exceeded the scheduler's wall-clock limit.
    #[error("run timed out after {0} seconds")]
    Timeout(u64),

    /// Malformed watcher, workflow, or variable configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lookup by id or name missed.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Unique-name collision or a self-referential cookie chain.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Variable extraction failed (bad pattern, JSON path miss, no match).
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Storage backend failure. The transaction in progress is rolled back.
    #[error("storage error: {0}")]
    Storage(String),

    /// The run was interrupted by shutdown or a manual stop.
    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Regex(#[from] regex::Error),

    #[error("config: {0}")]
    Config(#[from] crate::config::Error),
}

impl Error {
    /// Shortcut for a not-found error with a numeric id.
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
