//! Error types for the migration engine.

use thiserror::Error;

/// Result type alias using the caravan error type.
pub type Result<T> = std::result::Result<T, CaravanError>;

/// Main error type for the migration engine.
///
/// The variants mirror the failure taxonomy the pipeline distinguishes:
/// retryable transport problems (`RateLimited`, `Transient`), terminal HTTP
/// failures (`Client`, `Server`), batch-level job failures (`JobFailed`),
/// and per-record enrichment failures (`Enrichment`).
#[derive(Error, Debug)]
pub enum CaravanError {
    /// Rate limited by the remote API after exhausting the retry budget.
    #[error("rate limited after {attempts} attempts: {body}")]
    RateLimited { attempts: u32, body: String },

    /// Transient network failure (timeout, connection reset) that persisted
    /// through the bounded backoff schedule.
    #[error("transient network failure after {attempts} attempts: {error}")]
    Transient { attempts: u32, error: String },

    /// Non-retryable 4xx response, body captured for diagnostics.
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    /// Non-retryable 5xx response, body captured for diagnostics.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// A destination bulk job reached a terminal state other than completed.
    #[error("job {id} finished as '{status}' ({progress:?}/{total:?})")]
    JobFailed {
        id: String,
        status: String,
        progress: Option<u64>,
        total: Option<u64>,
    },

    /// Per-record enrichment side-fetch failed. Pagination continues; the
    /// affected record is reported through this error instead.
    #[error("enrichment failed for source record {source_id}: {source}")]
    Enrichment {
        source_id: i64,
        #[source]
        source: Box<CaravanError>,
    },

    /// Validation error (e.g., missing credentials). Fatal at startup.
    #[error("validation error: {0}")]
    Validation(String),

    /// A cooperative shutdown was requested while waiting or retrying.
    #[error("shutdown requested")]
    Shutdown,

    /// Record not found in the store.
    #[error("record not found: {0}")]
    RecordNotFound(i64),

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaravanError {
    /// True for transport-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            CaravanError::Transient { .. } => true,
            CaravanError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
