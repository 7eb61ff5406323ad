pub mod hpc_batch;
pub mod htc_grid;
pub mod kubernetes;
pub mod remote_htc;
pub mod wrapper;

use async_trait::async_trait;
use jc_core::{BackendError, Job};

/// Abstract phase a backend reports a job as being in, before it is mapped
/// onto the job's `JobStatus` by the Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    Running,
    Finished,
    Failed,
    Unknown,
}

/// One polymorphic contract, four implementations. Every adapter call is
/// I/O-bound and must not be invoked while holding the Registry lock.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit `job` to the external system. Idempotent across retries: calling
    /// this twice for the same `job_id` must return the existing `backend_job_id`
    /// rather than creating a duplicate external job.
    async fn submit(&self, job: &Job) -> Result<String, BackendError>;

    /// Best-effort stop; "already gone" and "never existed" both count as success.
    async fn stop(&self, job: &Job) -> Result<(), BackendError>;

    /// Pull the best available logs for the job, final or partial.
    async fn fetch_logs(&self, job: &Job) -> Result<String, BackendError>;

    /// Poll the backend-native status of a previously submitted job.
    async fn poll_status(&self, backend_job_id: &str) -> Result<BackendPhase, BackendError>;
}

/// Retry a transient-failing submission with exponential backoff, bounded by
/// `max_attempts`.
pub async fn submit_with_backoff<F, Fut>(max_attempts: u32, mut attempt: F) -> Result<String, BackendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<String, BackendError>>,
{
    let mut last_err = None;
    for n in 0..max_attempts.max(1) {
        match attempt().await {
            Ok(id) => return Ok(id),
            Err(e) if e.is_transient() && n + 1 < max_attempts => {
                let backoff_ms = 200u64 * 2u64.pow(n);
                tracing::warn!(attempt = n, backoff_ms, error = %e, "transient submission failure, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| BackendError::Connection("retry budget exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn backoff_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = submit_with_backoff(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::Timeout("slow".to_string()))
                } else {
                    Ok("backend-job-1".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "backend-job-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let result = submit_with_backoff(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Rejected("bad image".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
