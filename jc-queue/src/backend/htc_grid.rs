use std::path::PathBuf;

use async_trait::async_trait;
use jc_core::{BackendError, ComputeBackendParams, Job};
use tokio::fs;
use tokio::process::Command;

use super::{wrapper::build_wrapper_script, BackendPhase, JobBackend};

/// HTC-grid adapter: writes a submit description referencing a
/// wrapper script that restores the workspace and runs the command, then shells
/// out to `condor_submit` / `condor_q` / `condor_rm`.
pub struct HtcGridBackend {
    scratch_root: PathBuf,
}

impl HtcGridBackend {
    pub fn new(scratch_root: PathBuf) -> Self {
        Self { scratch_root }
    }

    fn scratch_dir(&self, job: &Job) -> PathBuf {
        self.scratch_root.join(job.job_id.to_string())
    }

    fn submit_description(
        job: &Job,
        unpacked_img: bool,
        accounting_group: Option<&str>,
        max_runtime: Option<i64>,
        scratch: &PathBuf,
    ) -> String {
        let mut description = format!(
            "executable = wrapper.sh\n\
             universe = vanilla\n\
             should_transfer_files = YES\n\
             when_to_transfer_output = ON_EXIT\n\
             output = stdout.log\n\
             error = stderr.log\n\
             log = condor.log\n\
             docker_image = {image}\n\
             +unpacked_image = {unpacked_img}\n\
             initialdir = {scratch}\n",
            image = job.docker_image,
            unpacked_img = unpacked_img,
            scratch = scratch.display(),
        );

        if let Some(group) = accounting_group {
            description.push_str(&format!("accounting_group = {group}\n"));
        }
        if let Some(seconds) = max_runtime {
            description.push_str(&format!("+MaxRuntime = {seconds}\n"));
        }

        description.push_str("queue\n");
        description
    }
}

#[async_trait]
impl JobBackend for HtcGridBackend {
    async fn submit(&self, job: &Job) -> Result<String, BackendError> {
        let scratch = self.scratch_dir(job);
        let marker_path = scratch.join(".condor_job_id");

        if let Ok(existing) = fs::read_to_string(&marker_path).await {
            let existing = existing.trim().to_string();
            if !existing.is_empty() {
                return Ok(existing);
            }
        }

        fs::create_dir_all(&scratch)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let (accounting_group, max_runtime, unpacked_img) = match &job.compute_backend_params {
            ComputeBackendParams::HtcGrid(params) => (
                params.htcondor_accounting_group.clone(),
                params.htcondor_max_runtime,
                params.unpacked_img.unwrap_or(false),
            ),
            _ => (None, None, false),
        };

        let script = build_wrapper_script(&job.cmd);
        fs::write(scratch.join("wrapper.sh"), script)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let description = Self::submit_description(
            job,
            unpacked_img,
            accounting_group.as_deref(),
            max_runtime,
            &scratch,
        );
        let description_path = scratch.join("submit.condor");
        fs::write(&description_path, description)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let output = Command::new("condor_submit")
            .arg("-terse")
            .arg(&description_path)
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        if !output.status.success() {
            return Err(BackendError::Rejected(String::from_utf8_lossy(&output.stderr).to_string()));
        }

        let cluster_id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .split('.')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        if cluster_id.is_empty() {
            return Err(BackendError::MalformedResponse("condor_submit produced no cluster id".to_string()));
        }

        fs::write(&marker_path, &cluster_id)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(cluster_id)
    }

    async fn stop(&self, job: &Job) -> Result<(), BackendError> {
        let Some(backend_job_id) = job.backend_job_id.as_ref() else {
            return Ok(());
        };
        let output = Command::new("condor_rm")
            .arg(backend_job_id)
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        // condor_rm on an unknown cluster id still exits 0 with a "not found" message.
        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::Connection(String::from_utf8_lossy(&output.stderr).to_string()))
        }
    }

    // TODO: stage-out protocol beyond "copy back into workspace root" is unspecified;
    // this reads the condor-transferred files directly from scratch rather than
    // staging them through an intermediate location.
    async fn fetch_logs(&self, job: &Job) -> Result<String, BackendError> {
        let scratch = self.scratch_dir(job);
        let stdout = fs::read_to_string(scratch.join("stdout.log")).await.unwrap_or_default();
        let stderr = fs::read_to_string(scratch.join("stderr.log")).await.unwrap_or_default();
        Ok(format!("{stdout}{stderr}"))
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<BackendPhase, BackendError> {
        let output = Command::new("condor_q")
            .arg(backend_job_id)
            .arg("-af")
            .arg("JobStatus")
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            // No longer in the queue; the job has left HTCondor's active pool.
            return Ok(BackendPhase::Unknown);
        }

        Ok(classify_condor_status(&stdout))
    }
}

/// Maps HTCondor's numeric `JobStatus` attribute (condor_q(1)).
fn classify_condor_status(status: &str) -> BackendPhase {
    match status {
        "1" => BackendPhase::Unknown, // Idle
        "2" => BackendPhase::Running, // Running
        "3" => BackendPhase::Unknown, // Removed
        "4" => BackendPhase::Finished,
        "5" => BackendPhase::Failed, // Held
        "6" => BackendPhase::Unknown, // Transferring output
        _ => BackendPhase::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_condor_running() {
        assert_eq!(classify_condor_status("2"), BackendPhase::Running);
    }

    #[test]
    fn classify_condor_completed() {
        assert_eq!(classify_condor_status("4"), BackendPhase::Finished);
    }

    #[test]
    fn classify_condor_held_as_failed() {
        assert_eq!(classify_condor_status("5"), BackendPhase::Failed);
    }
}
