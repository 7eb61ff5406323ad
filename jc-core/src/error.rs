use thiserror::Error;

use crate::ids::JobId;

/// Crate-wide error taxonomy, split between errors a job controller request
/// can fail with and errors a backend adapter call can fail with:
/// `JobControllerError` covers everything the HTTP surface and manager can
/// fail with, `BackendError` covers only what a backend adapter call can
/// fail with.
#[derive(Debug, Error)]
pub enum JobControllerError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("backend transient failure: {0}")]
    BackendTransient(#[source] BackendError),

    #[error("backend permanent failure: {0}")]
    BackendPermanent(#[source] BackendError),

    #[error("failed to stop job {job_id}: {source}")]
    BackendStopFailure {
        job_id: JobId,
        #[source]
        source: BackendError,
    },

    #[error("job controller is shutting down")]
    ShuttingDown,

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("database error: {0}")]
    Db(#[from] DbError),
}

impl JobControllerError {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Malformed(_) => 400,
            Self::NotFound(_) => 404,
            Self::InvalidTransition { .. } => 500,
            Self::BackendTransient(_) => 502,
            Self::BackendPermanent(_) => 502,
            Self::BackendStopFailure { .. } => 502,
            Self::ShuttingDown => 503,
            Self::Cache(_) => 500,
            Self::Db(_) => 500,
        }
    }
}

/// Errors a backend adapter call can produce. Transient errors are retried by
/// the Monitor up to a backend's retry budget; permanent errors terminalize the job.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection to backend failed: {0}")]
    Connection(String),

    #[error("backend rejected submission: {0}")]
    Rejected(String),

    #[error("backend job not found: {0}")]
    NotFound(String),

    #[error("backend timed out: {0}")]
    Timeout(String),

    #[error("backend returned malformed response: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    /// Whether the Monitor should retry or terminalize the job outright.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache archive lock contention on {0}")]
    Locked(String),

    #[error("cache fingerprint mismatch")]
    FingerprintMismatch,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database query failed: {0}")]
    Query(String),

    #[error("migration failed: {0}")]
    Migration(String),
}
