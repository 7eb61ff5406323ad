use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jc_core::{Backend, Job, JobId, JobStatus};
use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendPhase, JobBackend};
use crate::cache::JobCache;
use crate::db::Db;
use crate::registry::Registry;

/// Consecutive non-running observations tolerated before a job is declared stalled
/// and failed outright.
const STALL_THRESHOLD: u32 = 3;

/// Per-job-operation timeout; a slow backend call requeues for the next tick
/// rather than blocking the Monitor loop indefinitely.
const PER_JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// One long-running poll loop per enabled backend, explicitly constructed
/// and owned by the caller rather than an ambient global.
pub struct Monitor {
    backend_kind: Backend,
    backend: Arc<dyn JobBackend>,
    registry: Registry,
    db: Db,
    cache: JobCache,
    poll_interval: Duration,
    job_logs_max_bytes: usize,
    stall_counts: Arc<RwLock<HashMap<JobId, u32>>>,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(
        backend_kind: Backend,
        backend: Arc<dyn JobBackend>,
        registry: Registry,
        db: Db,
        cache: JobCache,
        poll_interval: Duration,
        job_logs_max_bytes: usize,
    ) -> Self {
        Self {
            backend_kind,
            backend,
            registry,
            db,
            cache,
            poll_interval,
            job_logs_max_bytes,
            stall_counts: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the poll loop until cancelled. Jittered around `poll_interval` so
    /// many monitors started together don't all hit the backend in lockstep.
    pub async fn run(self) {
        info!(backend = %self.backend_kind, interval = ?self.poll_interval, "monitor started");
        loop {
            let jitter_ms = rand::thread_rng().gen_range(0..1000);
            let tick = self.poll_interval + Duration::from_millis(jitter_ms);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(backend = %self.backend_kind, "monitor stopping");
                    return;
                }
                _ = tokio::time::sleep(tick) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let candidates: Vec<Job> = self
            .registry
            .snapshot()
            .into_values()
            .filter(|job| job.backend == self.backend_kind && !job.status.is_terminal())
            .collect();

        for job in candidates {
            if let Err(e) = self.observe_one(&job).await {
                warn!(job_id = %job.job_id, error = %e, "monitor tick failed for job");
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, backend = %self.backend_kind))]
    async fn observe_one(&self, job: &Job) -> Result<(), String> {
        let Some(backend_job_id) = job.backend_job_id.clone() else {
            return Ok(());
        };

        let phase = match tokio::time::timeout(PER_JOB_TIMEOUT, self.backend.poll_status(&backend_job_id)).await {
            Ok(Ok(phase)) => phase,
            Ok(Err(e)) => {
                debug!(error = %e, "poll_status error, will retry next tick");
                return Ok(());
            }
            Err(_) => {
                debug!("poll_status timed out, will retry next tick");
                return Ok(());
            }
        };

        match phase {
            BackendPhase::Running => {
                self.stall_counts.write().await.remove(&job.job_id);
                if job.status == JobStatus::Queued {
                    self.transition(job, JobStatus::Running, None).await?;
                }
            }
            BackendPhase::Finished => {
                self.terminalize(job, JobStatus::Finished, None).await?;
            }
            BackendPhase::Failed => {
                self.terminalize(job, JobStatus::Failed, None).await?;
            }
            BackendPhase::Unknown => {
                self.handle_unknown(job).await?;
            }
        }

        Ok(())
    }

    async fn handle_unknown(&self, job: &Job) -> Result<(), String> {
        if job.status != JobStatus::Queued {
            return Ok(());
        }

        let mut counts = self.stall_counts.write().await;
        let count = counts.entry(job.job_id.clone()).or_insert(0);
        *count += 1;

        if *count >= STALL_THRESHOLD {
            counts.remove(&job.job_id);
            drop(counts);
            self.terminalize(job, JobStatus::Failed, Some("job stalled before reaching running phase")).await?;
        }

        Ok(())
    }

    async fn transition(&self, job: &Job, next: JobStatus, diagnostic: Option<&str>) -> Result<(), String> {
        if let Some(diagnostic) = diagnostic {
            self.registry
                .append_logs(&job.job_id, &format!("\n[job-controller] {diagnostic}\n"), self.job_logs_max_bytes)
                .map_err(|e| e.to_string())?;
        }

        let updated = self.registry.update_status(&job.job_id, next).map_err(|e| e.to_string())?;

        self.db
            .update_job_status(&updated.job_id, updated.status, &updated.logs, updated.backend_job_id.as_deref())
            .await
            .map_err(|e| e.to_string())?;

        Ok(())
    }

    async fn terminalize(&self, job: &Job, next: JobStatus, diagnostic: Option<&str>) -> Result<(), String> {
        // Harvest final logs before removing the job from the live registry.
        let logs = tokio::time::timeout(PER_JOB_TIMEOUT, self.backend.fetch_logs(job))
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();

        if !logs.is_empty() {
            self.registry
                .append_logs(&job.job_id, &logs, self.job_logs_max_bytes)
                .map_err(|e| e.to_string())?;
        }

        if next == JobStatus::Finished {
            if let Some(cache_key) = job.cache_key.as_deref() {
                let workspace = Path::new(&job.workflow_workspace);
                if let Err(e) = self.cache.archive(cache_key, workspace).await {
                    warn!(job_id = %job.job_id, error = %e, "failed to archive workspace to cache");
                }
            }
        }

        self.transition(job, next, diagnostic).await?;
        self.registry.remove(&job.job_id);
        self.stall_counts.write().await.remove(&job.job_id);

        info!(job_id = %job.job_id, status = %next, "job terminalized");
        Ok(())
    }
}

/// Owns one Monitor per enabled backend ("Singleton monitor state" — an
/// explicitly-constructed set passed by reference, not an ambient global).
pub struct MonitorSet {
    handles: Vec<(Backend, tokio::task::JoinHandle<()>, CancellationToken)>,
}

impl MonitorSet {
    pub fn spawn(monitors: Vec<Monitor>) -> Self {
        let mut handles = Vec::with_capacity(monitors.len());
        for monitor in monitors {
            let backend_kind = monitor.backend_kind;
            let cancel = monitor.cancellation_token();
            let handle = tokio::spawn(monitor.run());
            handles.push((backend_kind, handle, cancel));
        }
        Self { handles }
    }

    /// Signal every monitor to exit its loop and wait for them to join.
    pub async fn shutdown(self) {
        for (backend, _, cancel) in &self.handles {
            debug!(%backend, "signalling monitor shutdown");
            cancel.cancel();
        }
        for (backend, handle, _) in self.handles {
            if let Err(e) = handle.await {
                warn!(%backend, error = %e, "monitor task join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JobBackend;
    use async_trait::async_trait;
    use jc_core::{BackendError, JobRequest};
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct FakeBackend {
        phase: BackendPhase,
        poll_calls: AtomicU32,
    }

    #[async_trait]
    impl JobBackend for FakeBackend {
        async fn submit(&self, _job: &Job) -> Result<String, BackendError> {
            Ok("fake-1".to_string())
        }
        async fn stop(&self, _job: &Job) -> Result<(), BackendError> {
            Ok(())
        }
        async fn fetch_logs(&self, _job: &Job) -> Result<String, BackendError> {
            Ok("hi\n".to_string())
        }
        async fn poll_status(&self, _backend_job_id: &str) -> Result<BackendPhase, BackendError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.phase)
        }
    }

    fn request() -> JobRequest {
        JobRequest {
            docker_img: "busybox".to_string(),
            job_name: "j1".to_string(),
            workflow_uuid: "w1".to_string(),
            workflow_workspace: "/w/w1".to_string(),
            cmd: "echo hi".to_string(),
            env_vars: Map::new(),
            compute_backend: Backend::Kubernetes,
            cvmfs_mounts: None,
            shared_file_system: true,
            prettified_cmd: None,
            unpacked_img: None,
            kerberos: None,
            voms_proxy: None,
            rucio: None,
            kubernetes_uid: None,
            kubernetes_memory_limit: None,
            kubernetes_job_timeout: None,
            htcondor_accounting_group: None,
            htcondor_max_runtime: None,
            slurm_partition: None,
            slurm_time: None,
            c4p_cpu_cores: None,
            c4p_memory_limit: None,
            c4p_additional_requirements: None,
        workflow_json: None,
        input_files_digest_map: None,
        }
    }

    #[tokio::test]
    async fn finished_phase_terminalizes_and_removes_from_registry() {
        let db = Db::connect_in_memory().await.unwrap();
        let registry = Registry::new();

        let mut job = Job::new(JobId::new(), &request());
        job.backend_job_id = Some("fake-1".to_string());
        job.status = JobStatus::Running;
        let job_id = job.job_id.clone();
        registry.insert(job.clone()).unwrap();
        db.insert_job(&job).await.unwrap();

        let backend: Arc<dyn JobBackend> = Arc::new(FakeBackend {
            phase: BackendPhase::Finished,
            poll_calls: AtomicU32::new(0),
        });

        let workspace_root = tempdir().unwrap();
        let cache = JobCache::new(db.clone(), workspace_root.path().to_path_buf());
        let monitor = Monitor::new(Backend::Kubernetes, backend, registry.clone(), db, cache, Duration::from_secs(60), 1024);
        monitor.tick().await;

        assert!(registry.get(&job_id).is_none());
    }

    #[tokio::test]
    async fn finished_phase_with_cache_key_archives_workspace() {
        let db = Db::connect_in_memory().await.unwrap();
        let registry = Registry::new();

        let workspace_root = tempdir().unwrap();
        let workspace = workspace_root.path().join("w1");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("result.txt"), b"done").unwrap();

        let mut req = request();
        req.workflow_workspace = workspace.to_string_lossy().to_string();
        let mut job = Job::new(JobId::new(), &req);
        job.backend_job_id = Some("fake-1".to_string());
        job.status = JobStatus::Running;
        job.cache_key = Some("fp-1".to_string());
        let job_id = job.job_id.clone();
        registry.insert(job.clone()).unwrap();
        db.insert_job(&job).await.unwrap();

        let backend: Arc<dyn JobBackend> = Arc::new(FakeBackend {
            phase: BackendPhase::Finished,
            poll_calls: AtomicU32::new(0),
        });

        let cache = JobCache::new(db.clone(), workspace_root.path().to_path_buf());
        let monitor = Monitor::new(Backend::Kubernetes, backend, registry.clone(), db.clone(), cache.clone(), Duration::from_secs(60), 1024);
        monitor.tick().await;

        assert!(registry.get(&job_id).is_none());
        let result_path = cache.lookup("fp-1").await.unwrap().expect("cache row should be inserted on finish");
        assert!(std::path::Path::new(&result_path).join("result.txt").exists());
    }

    #[tokio::test]
    async fn unknown_phase_below_threshold_does_not_terminalize() {
        let db = Db::connect_in_memory().await.unwrap();
        let registry = Registry::new();

        let job = Job::new(JobId::new(), &request());
        let mut job = job;
        job.backend_job_id = Some("fake-1".to_string());
        let job_id = job.job_id.clone();
        registry.insert(job.clone()).unwrap();
        db.insert_job(&job).await.unwrap();

        let backend: Arc<dyn JobBackend> = Arc::new(FakeBackend {
            phase: BackendPhase::Unknown,
            poll_calls: AtomicU32::new(0),
        });

        let workspace_root = tempdir().unwrap();
        let cache = JobCache::new(db.clone(), workspace_root.path().to_path_buf());
        let monitor = Monitor::new(Backend::Kubernetes, backend, registry.clone(), db, cache, Duration::from_secs(60), 1024);
        monitor.tick().await;
        monitor.tick().await;

        assert!(registry.get(&job_id).is_some());
    }

    #[tokio::test]
    async fn unknown_phase_at_threshold_fails_the_job() {
        let db = Db::connect_in_memory().await.unwrap();
        let registry = Registry::new();

        let mut job = Job::new(JobId::new(), &request());
        job.backend_job_id = Some("fake-1".to_string());
        let job_id = job.job_id.clone();
        registry.insert(job.clone()).unwrap();
        db.insert_job(&job).await.unwrap();

        let backend: Arc<dyn JobBackend> = Arc::new(FakeBackend {
            phase: BackendPhase::Unknown,
            poll_calls: AtomicU32::new(0),
        });

        let workspace_root = tempdir().unwrap();
        let cache = JobCache::new(db.clone(), workspace_root.path().to_path_buf());
        let monitor = Monitor::new(Backend::Kubernetes, backend, registry.clone(), db, cache, Duration::from_secs(60), 1024);
        for _ in 0..STALL_THRESHOLD {
            monitor.tick().await;
        }

        assert!(registry.get(&job_id).is_none());
    }
}
