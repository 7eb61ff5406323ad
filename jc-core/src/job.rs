use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, ComputeBackendParams};
use crate::ids::JobId;
use crate::status::JobStatus;

/// Immutable submission data for a job, as accepted from `POST /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub docker_img: String,
    pub job_name: String,
    pub workflow_uuid: String,
    pub workflow_workspace: String,

    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default = "default_backend")]
    pub compute_backend: Backend,
    #[serde(default)]
    pub cvmfs_mounts: Option<String>,
    #[serde(default = "default_true")]
    pub shared_file_system: bool,
    #[serde(default)]
    pub prettified_cmd: Option<String>,
    #[serde(default)]
    pub unpacked_img: Option<bool>,
    #[serde(default)]
    pub kerberos: Option<bool>,
    #[serde(default)]
    pub voms_proxy: Option<bool>,
    #[serde(default)]
    pub rucio: Option<bool>,

    #[serde(default)]
    pub kubernetes_uid: Option<i64>,
    #[serde(default)]
    pub kubernetes_memory_limit: Option<String>,
    #[serde(default)]
    pub kubernetes_job_timeout: Option<i64>,
    #[serde(default)]
    pub htcondor_accounting_group: Option<String>,
    #[serde(default)]
    pub htcondor_max_runtime: Option<i64>,
    #[serde(default)]
    pub slurm_partition: Option<String>,
    #[serde(default)]
    pub slurm_time: Option<String>,
    #[serde(default)]
    pub c4p_cpu_cores: Option<i64>,
    #[serde(default)]
    pub c4p_memory_limit: Option<String>,
    #[serde(default)]
    pub c4p_additional_requirements: Option<String>,

    /// Workflow specification used only to compute the cache fingerprint;
    /// absence means the submission does not participate in caching.
    #[serde(default)]
    pub workflow_json: Option<serde_json::Value>,
    #[serde(default)]
    pub input_files_digest_map: Option<serde_json::Value>,
}

fn default_backend() -> Backend {
    Backend::Kubernetes
}

fn default_true() -> bool {
    true
}

impl JobRequest {
    /// Assemble the tagged per-backend parameter bag this request carries,
    /// parsed once at the HTTP boundary.
    pub fn compute_backend_params(&self) -> ComputeBackendParams {
        match self.compute_backend {
            Backend::Kubernetes => ComputeBackendParams::Kubernetes(crate::backend::KubernetesParams {
                kubernetes_uid: self.kubernetes_uid,
                kubernetes_memory_limit: self.kubernetes_memory_limit.clone(),
                kubernetes_job_timeout: self.kubernetes_job_timeout,
            }),
            Backend::HtcGrid => ComputeBackendParams::HtcGrid(crate::backend::HtcGridParams {
                htcondor_accounting_group: self.htcondor_accounting_group.clone(),
                htcondor_max_runtime: self.htcondor_max_runtime,
                unpacked_img: self.unpacked_img,
            }),
            Backend::HpcBatch => ComputeBackendParams::HpcBatch(crate::backend::HpcBatchParams {
                slurm_partition: self.slurm_partition.clone(),
                slurm_time: self.slurm_time.clone(),
            }),
            Backend::RemoteHtc => ComputeBackendParams::RemoteHtc(crate::backend::RemoteHtcParams {
                c4p_cpu_cores: self.c4p_cpu_cores,
                c4p_memory_limit: self.c4p_memory_limit.clone(),
                c4p_additional_requirements: self.c4p_additional_requirements.clone(),
            }),
        }
    }
}

/// The core Job entity. Exclusively owned by the Manager during `execute`;
/// ownership transfers to the Registry on successful submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub backend: Backend,
    pub backend_job_id: Option<String>,
    pub workflow_uuid: String,
    pub workflow_workspace: String,
    pub docker_image: String,
    pub cmd: String,
    pub env: HashMap<String, String>,
    pub status: JobStatus,
    pub logs: String,
    pub compute_backend_params: ComputeBackendParams,
    pub cvmfs_mounts: Option<String>,
    /// Cache fingerprint computed at submit time, if the request opted into
    /// caching. Archived to the result cache on a `Finished` transition.
    pub cache_key: Option<String>,
    pub restart_count: u32,
    pub max_restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: JobId, request: &JobRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            backend: request.compute_backend,
            backend_job_id: None,
            workflow_uuid: request.workflow_uuid.clone(),
            workflow_workspace: request.workflow_workspace.clone(),
            docker_image: request.docker_img.clone(),
            cmd: request.cmd.clone(),
            env: request.env_vars.clone(),
            status: JobStatus::Queued,
            logs: String::new(),
            compute_backend_params: request.compute_backend_params(),
            cvmfs_mounts: request.cvmfs_mounts.clone(),
            cache_key: None,
            restart_count: 0,
            max_restart_count: 3,
            created_at: now,
            updated_at: now,
        }
    }

    /// Synthesize a cache-hit job: `finished`, no backend submission ever happened.
    pub fn new_cached(job_id: JobId, request: &JobRequest) -> Self {
        let mut job = Self::new(job_id, request);
        job.status = JobStatus::Finished;
        job.backend_job_id = Some("cache-hit".to_string());
        job
    }
}

/// Public response projection of a Job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: JobId,
    pub cmd: String,
    pub cvmfs_mounts: Option<String>,
    pub docker_img: String,
    pub status: JobStatus,
    pub restart_count: u32,
    pub max_restart_count: u32,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            cmd: job.cmd.clone(),
            cvmfs_mounts: job.cvmfs_mounts.clone(),
            docker_img: job.docker_image.clone(),
            status: job.status,
            restart_count: job.restart_count,
            max_restart_count: job.max_restart_count,
        }
    }
}
