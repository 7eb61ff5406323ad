use std::collections::BTreeMap;

use async_trait::async_trait;
use jc_core::{BackendError, ComputeBackendParams, Job};
use k8s_openapi::api::batch::v1::{Job as K8sJob, JobSpec, JobStatus as K8sJobStatus};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, ListParams, LogParams, ObjectMeta, PostParams};
use kube::{Api, Client};

use super::{wrapper::build_wrapper_script, BackendPhase, JobBackend};

/// Container-orchestrator adapter. Builds one
/// Kubernetes `Job` object per submission, labeled by `job_id` for idempotent
/// lookup and for the Monitor's label-filtered watch.
pub struct KubernetesBackend {
    namespace: String,
    default_memory_limit: String,
}

impl KubernetesBackend {
    pub fn new(namespace: String, default_memory_limit: String) -> Self {
        Self {
            namespace,
            default_memory_limit,
        }
    }

    async fn client(&self) -> Result<Client, BackendError> {
        Client::try_default()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))
    }

    fn job_name(job: &Job) -> String {
        format!("rjc-{}", job.job_id)
    }

    fn build_job_spec(&self, job: &Job) -> K8sJob {
        let name = Self::job_name(job);
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "reana-job-controller".to_string());
        labels.insert("job-id".to_string(), job.job_id.to_string());
        labels.insert("workflow-uuid".to_string(), job.workflow_uuid.clone());

        let memory_limit = match &job.compute_backend_params {
            ComputeBackendParams::Kubernetes(params) => params
                .kubernetes_memory_limit
                .clone()
                .unwrap_or_else(|| self.default_memory_limit.clone()),
            _ => self.default_memory_limit.clone(),
        };

        let mut limits = BTreeMap::new();
        limits.insert("memory".to_string(), Quantity(memory_limit));

        let env_vars: Vec<EnvVar> = job
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        let script = build_wrapper_script(&job.cmd);

        K8sJob {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "job".to_string(),
                            image: Some(job.docker_image.clone()),
                            command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
                            env: Some(env_vars),
                            resources: Some(ResourceRequirements {
                                limits: Some(limits),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl JobBackend for KubernetesBackend {
    async fn submit(&self, job: &Job) -> Result<String, BackendError> {
        let client = self.client().await?;
        let api: Api<K8sJob> = Api::namespaced(client, &self.namespace);
        let name = Self::job_name(job);

        // Idempotent across retries: if a job with this name already exists, reuse it.
        if let Ok(existing) = api.get(&name).await {
            return Ok(existing.metadata.name.unwrap_or(name));
        }

        let spec = self.build_job_spec(job);
        let created = api
            .create(&PostParams::default(), &spec)
            .await
            .map_err(|e| BackendError::Rejected(e.to_string()))?;

        Ok(created.metadata.name.unwrap_or(name))
    }

    async fn stop(&self, job: &Job) -> Result<(), BackendError> {
        let Some(backend_job_id) = job.backend_job_id.as_ref() else {
            return Ok(());
        };
        let client = self.client().await?;
        let api: Api<K8sJob> = Api::namespaced(client, &self.namespace);

        match api.delete(backend_job_id, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(BackendError::Connection(e.to_string())),
        }
    }

    async fn fetch_logs(&self, job: &Job) -> Result<String, BackendError> {
        let Some(backend_job_id) = job.backend_job_id.as_ref() else {
            return Ok(String::new());
        };
        let client = self.client().await?;
        let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client, &self.namespace);

        let selector = format!("job-name={backend_job_id}");
        let list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let Some(pod) = list.items.into_iter().next() else {
            return Ok(String::new());
        };
        let pod_name = pod.metadata.name.unwrap_or_default();

        pods.logs(&pod_name, &LogParams::default())
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<BackendPhase, BackendError> {
        let client = self.client().await?;
        let api: Api<K8sJob> = Api::namespaced(client, &self.namespace);

        let job = match api.get(backend_job_id).await {
            Ok(job) => job,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(BackendPhase::Unknown),
            Err(e) => return Err(BackendError::Connection(e.to_string())),
        };

        Ok(classify_status(job.status.as_ref()))
    }
}

fn classify_status(status: Option<&K8sJobStatus>) -> BackendPhase {
    let Some(status) = status else {
        return BackendPhase::Unknown;
    };

    if status.succeeded.unwrap_or(0) > 0 {
        BackendPhase::Finished
    } else if status.failed.unwrap_or(0) > 0 {
        BackendPhase::Failed
    } else if status.active.unwrap_or(0) > 0 {
        BackendPhase::Running
    } else {
        BackendPhase::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_succeeded_job() {
        let status = K8sJobStatus {
            succeeded: Some(1),
            ..Default::default()
        };
        assert_eq!(classify_status(Some(&status)), BackendPhase::Finished);
    }

    #[test]
    fn classify_failed_job() {
        let status = K8sJobStatus {
            failed: Some(1),
            ..Default::default()
        };
        assert_eq!(classify_status(Some(&status)), BackendPhase::Failed);
    }

    #[test]
    fn classify_active_job() {
        let status = K8sJobStatus {
            active: Some(1),
            ..Default::default()
        };
        assert_eq!(classify_status(Some(&status)), BackendPhase::Running);
    }

    #[test]
    fn classify_missing_status() {
        assert_eq!(classify_status(None), BackendPhase::Unknown);
    }
}
