use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jc_core::{Backend, BackendError, Job, JobRequest, JobStatus};
use jc_queue::{BackendPhase, Db, JobBackend, JobCache, JobManager, Registry};
use tempfile::tempdir;

struct ScriptedBackend {
    phase_after_submit: BackendPhase,
    submit_calls: AtomicU32,
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn submit(&self, _job: &Job) -> Result<String, BackendError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        Ok("backend-job-1".to_string())
    }

    async fn stop(&self, _job: &Job) -> Result<(), BackendError> {
        Ok(())
    }

    async fn fetch_logs(&self, _job: &Job) -> Result<String, BackendError> {
        Ok("hi\n".to_string())
    }

    async fn poll_status(&self, _backend_job_id: &str) -> Result<BackendPhase, BackendError> {
        Ok(self.phase_after_submit)
    }
}

fn base_request(workspace: &Path) -> JobRequest {
    JobRequest {
        docker_img: "busybox".to_string(),
        job_name: "j1".to_string(),
        workflow_uuid: "w1".to_string(),
        workflow_workspace: workspace.to_string_lossy().to_string(),
        cmd: "echo hi".to_string(),
        env_vars: HashMap::new(),
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

/// Scenario 1 from the end-to-end list: submit a job and observe it reach
/// `finished` once the Monitor sees the backend report it done.
#[tokio::test]
async fn submit_then_monitor_drives_job_to_finished() {
    let root = tempdir().unwrap();
    let workspace = root.path().join("w1");
    std::fs::create_dir_all(&workspace).unwrap();

    let db = Db::connect_in_memory().await.unwrap();
    let cache = JobCache::new(db.clone(), root.path().to_path_buf());
    let backend = Arc::new(ScriptedBackend {
        phase_after_submit: BackendPhase::Finished,
        submit_calls: AtomicU32::new(0),
    });

    let mut backends: std::collections::HashMap<Backend, Arc<dyn JobBackend>> = std::collections::HashMap::new();
    backends.insert(Backend::Kubernetes, backend.clone());

    let registry = Registry::new();
    let manager = JobManager::new(backends, registry.clone(), db.clone(), cache, root.path().to_path_buf(), 1024 * 1024);

    let job_id = manager.execute(base_request(&workspace)).await.unwrap();

    let job = registry.get(&job_id).expect("job should be live in the registry");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.snapshot().len(), 1);

    // The Monitor's tick body is private; exercise the same registry/db
    // surface it drives a finished job through.
    let updated = registry.update_status(&job_id, JobStatus::Finished).unwrap();
    assert!(updated.status.is_terminal());
    db.update_job_status(&job_id, updated.status, &updated.logs, updated.backend_job_id.as_deref())
        .await
        .unwrap();

    let db_job = db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(db_job.status, JobStatus::Finished);
}

/// Scenario 2: submitting the same cache-enabled spec twice only calls the
/// backend once; the second call is a cache hit.
#[tokio::test]
async fn duplicate_cache_enabled_submission_is_a_cache_hit() {
    let root = tempdir().unwrap();
    let workspace = root.path().join("w1");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::write(workspace.join("result.txt"), b"done").unwrap();

    let db = Db::connect_in_memory().await.unwrap();
    let cache = JobCache::new(db.clone(), root.path().to_path_buf());
    let backend = Arc::new(ScriptedBackend {
        phase_after_submit: BackendPhase::Finished,
        submit_calls: AtomicU32::new(0),
    });
    let mut backends: std::collections::HashMap<Backend, Arc<dyn JobBackend>> = std::collections::HashMap::new();
    backends.insert(Backend::Kubernetes, backend.clone());

    let registry = Registry::new();
    let manager = JobManager::new(backends, registry.clone(), db.clone(), cache, root.path().to_path_buf(), 1024 * 1024);

    let mut request = base_request(&workspace);
    request.workflow_json = Some(serde_json::json!({"steps": ["a"]}));

    let first_job_id = manager.execute(request.clone()).await.unwrap();
    assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 1);

    // Monitor::terminalize does this automatically on a Finished transition;
    // reproduced here since the Monitor's tick loop isn't reachable from an
    // integration test.
    let fingerprint_spec = jc_queue::CacheSpec {
        cmd: &request.cmd,
        docker_image: &request.docker_img,
        env: &request.env_vars,
        compute_backend_params: &request.compute_backend_params(),
        workflow_json: request.workflow_json.as_ref().unwrap(),
        input_files_digest_map: &serde_json::Value::Object(Default::default()),
    };
    let key = jc_queue::fingerprint(&fingerprint_spec).unwrap();
    let cache = JobCache::new(db.clone(), root.path().to_path_buf());
    cache.archive(&key, &workspace).await.unwrap();

    let second_job_id = manager.execute(request).await.unwrap();
    assert_ne!(first_job_id, second_job_id);
    assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 1, "cache hit must not re-submit");

    let second_job = db.get_job(&second_job_id).await.unwrap().unwrap();
    assert_eq!(second_job.status, JobStatus::Finished);
}

/// Scenario 3: a backend that always rejects submission yields a `failed`
/// job, not an HTTP error.
#[tokio::test]
async fn backend_rejection_yields_failed_job_not_error() {
    struct RejectingBackend;

    #[async_trait]
    impl JobBackend for RejectingBackend {
        async fn submit(&self, _job: &Job) -> Result<String, BackendError> {
            Err(BackendError::Rejected("image not found".to_string()))
        }
        async fn stop(&self, _job: &Job) -> Result<(), BackendError> {
            Ok(())
        }
        async fn fetch_logs(&self, _job: &Job) -> Result<String, BackendError> {
            Ok(String::new())
        }
        async fn poll_status(&self, _backend_job_id: &str) -> Result<BackendPhase, BackendError> {
            Ok(BackendPhase::Unknown)
        }
    }

    let root = tempdir().unwrap();
    let workspace = root.path().join("w1");
    std::fs::create_dir_all(&workspace).unwrap();

    let db = Db::connect_in_memory().await.unwrap();
    let cache = JobCache::new(db.clone(), root.path().to_path_buf());
    let mut backends: std::collections::HashMap<Backend, Arc<dyn JobBackend>> = std::collections::HashMap::new();
    backends.insert(Backend::Kubernetes, Arc::new(RejectingBackend));

    let registry = Registry::new();
    let manager = JobManager::new(backends, registry.clone(), db.clone(), cache, root.path().to_path_buf(), 1024 * 1024);

    let job_id = manager.execute(base_request(&workspace)).await.unwrap();

    assert!(registry.get(&job_id).is_none());
    let job = db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.logs.contains("image not found"));
}
