use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jc_core::{Backend, BackendError, Job, JobControllerError, JobId, JobRequest, JobStatus};
use tracing::{info, instrument, warn};

use crate::backend::{submit_with_backoff, JobBackend};
use crate::cache::{fingerprint, CacheSpec, JobCache};
use crate::db::Db;
use crate::registry::Registry;

const SUBMIT_MAX_ATTEMPTS: u32 = 4;

/// Ties the Adapter set, Registry, DB, and Cache together behind `execute`/`stop`.
/// The pipeline is a linear sequence with explicit rollback on each failing
/// step, not a decorator chain.
pub struct JobManager {
    backends: HashMap<Backend, Arc<dyn JobBackend>>,
    registry: Registry,
    db: Db,
    cache: JobCache,
    workspace_root: PathBuf,
    job_logs_max_bytes: usize,
}

impl JobManager {
    pub fn new(
        backends: HashMap<Backend, Arc<dyn JobBackend>>,
        registry: Registry,
        db: Db,
        cache: JobCache,
        workspace_root: PathBuf,
        job_logs_max_bytes: usize,
    ) -> Self {
        Self {
            backends,
            registry,
            db,
            cache,
            workspace_root,
            job_logs_max_bytes,
        }
    }

    /// Submit a job. Returns the `job_id` for both a fresh submission and a
    /// cache hit; a permanent or retry-exhausted backend failure still returns
    /// `Ok` with a `failed` job recorded — only pre-registry validation errors
    /// are returned as `Err`.
    #[instrument(skip(self, request), fields(workflow_uuid = %request.workflow_uuid, backend = %request.compute_backend))]
    pub async fn execute(&self, request: JobRequest) -> Result<JobId, JobControllerError> {
        self.validate_workspace_containment(&request.workflow_workspace)?;

        let backend_kind = request.compute_backend;
        let backend = self
            .backends
            .get(&backend_kind)
            .ok_or_else(|| JobControllerError::Malformed(format!("compute backend {backend_kind} is not enabled")))?
            .clone();

        let job_id = JobId::new();
        let cache_key = self.cache_spec_fingerprint(&request)?;

        if let Some(cache_key) = cache_key.as_deref() {
            if let Some(result_path) = self.cache.lookup(cache_key).await? {
                let workspace = PathBuf::from(&request.workflow_workspace);
                self.cache.hydrate(&result_path, &workspace).await?;

                let job = Job::new_cached(job_id.clone(), &request);
                self.db.insert_job(&job).await?;

                info!(%job_id, "cache hit, submission short-circuited");
                return Ok(job_id);
            }
        }

        let mut job = Job::new(job_id.clone(), &request);
        job.cache_key = cache_key;

        match submit_with_backoff(SUBMIT_MAX_ATTEMPTS, || backend.submit(&job)).await {
            Ok(backend_job_id) => {
                job.status = JobStatus::Running;
                job.backend_job_id = Some(backend_job_id);

                self.registry.insert(job.clone()).map_err(|e| {
                    warn!(%job_id, error = %e, "registry insert failed after successful submit");
                    e
                })?;

                if let Err(e) = self.db.insert_job(&job).await {
                    // Roll back the registry publish so the Registry and DB don't disagree.
                    self.registry.remove(&job_id);
                    return Err(e);
                }

                info!(%job_id, backend_job_id = ?job.backend_job_id, "job submitted");
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.logs = format!("[job-controller] submission failed: {e}\n");
                job.logs.truncate(self.job_logs_max_bytes.min(job.logs.len()));
                self.db.insert_job(&job).await?;
                warn!(%job_id, error = %e, "submission failed permanently, job recorded as failed");
            }
        }

        Ok(job_id)
    }

    /// Stop a job: best-effort adapter stop, then mark `stopped` if the job is
    /// still live. Already-terminal jobs are a no-op success.
    #[instrument(skip(self))]
    pub async fn stop(&self, job_id: &JobId) -> Result<(), JobControllerError> {
        let Some(job) = self.registry.get(job_id) else {
            // Either unknown or already terminal and removed; both are a no-op.
            return Ok(());
        };

        let backend = self
            .backends
            .get(&job.backend)
            .ok_or_else(|| JobControllerError::Malformed(format!("compute backend {} is not enabled", job.backend)))?
            .clone();

        backend.stop(&job).await.map_err(|source| JobControllerError::BackendStopFailure {
            job_id: job_id.clone(),
            source,
        })?;

        let updated = self.registry.update_status(job_id, JobStatus::Stopped)?;
        self.db
            .update_job_status(job_id, updated.status, &updated.logs, updated.backend_job_id.as_deref())
            .await?;
        self.registry.remove(job_id);

        Ok(())
    }

    fn validate_workspace_containment(&self, workflow_workspace: &str) -> Result<(), JobControllerError> {
        let root = self
            .workspace_root
            .canonicalize()
            .map_err(|e| JobControllerError::Malformed(format!("invalid workspace root: {e}")))?;

        let requested = Path::new(workflow_workspace);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.workspace_root.join(requested)
        };

        let canonical = candidate
            .canonicalize()
            .map_err(|_| JobControllerError::Malformed(format!("workflow_workspace {workflow_workspace} does not exist")))?;

        if !canonical.starts_with(&root) {
            return Err(JobControllerError::Malformed(format!(
                "workflow_workspace {workflow_workspace} is outside the configured workspace root"
            )));
        }

        Ok(())
    }

    /// Compute the cache fingerprint when the request opts into caching by
    /// supplying a `workflow_json` spec; its absence means the submission
    /// does not participate in caching.
    fn cache_spec_fingerprint(&self, request: &JobRequest) -> Result<Option<String>, JobControllerError> {
        let Some(workflow_json) = request.workflow_json.as_ref() else {
            return Ok(None);
        };
        let empty_digests = serde_json::Value::Object(Default::default());
        let digests = request.input_files_digest_map.as_ref().unwrap_or(&empty_digests);
        let params = request.compute_backend_params();

        let spec = CacheSpec {
            cmd: &request.cmd,
            docker_image: &request.docker_img,
            env: &request.env_vars,
            compute_backend_params: &params,
            workflow_json,
            input_files_digest_map: digests,
        };

        Ok(Some(fingerprint(&spec)?))
    }
}
