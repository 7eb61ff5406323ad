use async_trait::async_trait;
use jc_core::{BackendError, ComputeBackendParams, Job};
use serde::{Deserialize, Serialize};

use super::{wrapper::build_wrapper_script, BackendPhase, JobBackend};

/// Remote-HTC adapter: submits through a token-authenticated
/// HTTP gateway, similar in shape to HTC-grid but without direct scheduler access.
pub struct RemoteHtcBackend {
    gateway_url: String,
    token_issuer_url: String,
    client: reqwest::Client,
}

impl RemoteHtcBackend {
    pub fn new(gateway_url: String, token_issuer_url: String) -> Self {
        Self {
            gateway_url,
            token_issuer_url,
            client: reqwest::Client::new(),
        }
    }

    async fn machine_token(&self) -> Result<String, BackendError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let response = self
            .client
            .post(&self.token_issuer_url)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?
            .error_for_status()
            .map_err(|e| BackendError::Connection(e.to_string()))?
            .json::<TokenResponse>()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        Ok(response.access_token)
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    job_id: String,
    docker_image: &'a str,
    wrapper_script: String,
    cpu_cores: Option<i64>,
    memory_limit: Option<&'a str>,
    additional_requirements: Option<&'a str>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    remote_job_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    phase: String,
}

#[derive(Deserialize)]
struct LogsResponse {
    log: String,
}

#[async_trait]
impl JobBackend for RemoteHtcBackend {
    async fn submit(&self, job: &Job) -> Result<String, BackendError> {
        let token = self.machine_token().await?;

        let (cpu_cores, memory_limit, additional_requirements) = match &job.compute_backend_params {
            ComputeBackendParams::RemoteHtc(params) => (
                params.c4p_cpu_cores,
                params.c4p_memory_limit.as_deref(),
                params.c4p_additional_requirements.as_deref(),
            ),
            _ => (None, None, None),
        };

        let body = SubmitRequest {
            job_id: job.job_id.to_string(),
            docker_image: &job.docker_image,
            wrapper_script: build_wrapper_script(&job.cmd),
            cpu_cores,
            memory_limit,
            additional_requirements,
        };

        let response = self
            .client
            .post(format!("{}/jobs", self.gateway_url))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            // Gateway treats a duplicate job_id submission as idempotent and
            // returns the existing remote job id under the same key.
            let existing = response
                .json::<SubmitResponse>()
                .await
                .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
            return Ok(existing.remote_job_id);
        }

        let response = response
            .error_for_status()
            .map_err(|e| BackendError::Rejected(e.to_string()))?
            .json::<SubmitResponse>()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        Ok(response.remote_job_id)
    }

    async fn stop(&self, job: &Job) -> Result<(), BackendError> {
        let Some(backend_job_id) = job.backend_job_id.as_ref() else {
            return Ok(());
        };
        let token = self.machine_token().await?;

        let response = self
            .client
            .delete(format!("{}/jobs/{}", self.gateway_url, backend_job_id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(BackendError::Connection(format!("gateway stop failed: {}", response.status())))
        }
    }

    async fn fetch_logs(&self, job: &Job) -> Result<String, BackendError> {
        let Some(backend_job_id) = job.backend_job_id.as_ref() else {
            return Ok(String::new());
        };
        let token = self.machine_token().await?;

        let response = self
            .client
            .get(format!("{}/jobs/{}/logs", self.gateway_url, backend_job_id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?
            .error_for_status()
            .map_err(|e| BackendError::Connection(e.to_string()))?
            .json::<LogsResponse>()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        Ok(response.log)
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<BackendPhase, BackendError> {
        let token = self.machine_token().await?;

        let response = self
            .client
            .get(format!("{}/jobs/{}", self.gateway_url, backend_job_id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(BackendPhase::Unknown);
        }

        let response = response
            .error_for_status()
            .map_err(|e| BackendError::Connection(e.to_string()))?
            .json::<StatusResponse>()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        Ok(classify_phase(&response.phase))
    }
}

fn classify_phase(phase: &str) -> BackendPhase {
    match phase {
        "running" => BackendPhase::Running,
        "finished" => BackendPhase::Finished,
        "failed" => BackendPhase::Failed,
        _ => BackendPhase::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_phases() {
        assert_eq!(classify_phase("running"), BackendPhase::Running);
        assert_eq!(classify_phase("finished"), BackendPhase::Finished);
        assert_eq!(classify_phase("failed"), BackendPhase::Failed);
        assert_eq!(classify_phase("queued"), BackendPhase::Unknown);
    }
}
