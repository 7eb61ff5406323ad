use std::collections::HashMap;
use std::sync::Arc;

use jc_core::{Job, JobControllerError, JobId, JobStatus};
use parking_lot::RwLock;

/// Process-wide map of live jobs, guarded by a single lock. A job is present
/// here iff it is non-terminal, or terminal but not yet observed/removed by a Monitor.
#[derive(Clone, Default)]
pub struct Registry {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn insert(&self, job: Job) -> Result<(), JobControllerError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.job_id) {
            return Err(JobControllerError::Malformed(format!(
                "job {} already present in registry",
                job.job_id
            )));
        }
        jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs.read().contains_key(job_id)
    }

    /// Move a job to `next`, enforcing monotonicity.
    pub fn update_status(&self, job_id: &JobId, next: JobStatus) -> Result<Job, JobControllerError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobControllerError::NotFound(job_id.clone()))?;

        if !job.status.can_transition_to(next) {
            return Err(JobControllerError::InvalidTransition {
                job_id: job_id.clone(),
                from: job.status.name(),
                to: next.name(),
            });
        }

        job.status = next;
        job.updated_at = chrono::Utc::now();
        Ok(job.clone())
    }

    pub fn append_logs(&self, job_id: &JobId, chunk: &str, max_bytes: usize) -> Result<(), JobControllerError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobControllerError::NotFound(job_id.clone()))?;

        job.logs.push_str(chunk);
        if job.logs.len() > max_bytes {
            job.logs.truncate(max_bytes);
            job.logs.push_str("\n[job-controller] logs truncated, limit exceeded\n");
        }
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub fn set_backend_job_id(&self, job_id: &JobId, backend_job_id: String) -> Result<(), JobControllerError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobControllerError::NotFound(job_id.clone()))?;

        if job.backend_job_id.is_none() {
            job.backend_job_id = Some(backend_job_id);
            job.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    pub fn remove(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.write().remove(job_id)
    }

    /// A deep copy of every live job, taken without holding the lock across
    /// serialization at the HTTP boundary.
    pub fn snapshot(&self) -> HashMap<JobId, Job> {
        self.jobs.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}
