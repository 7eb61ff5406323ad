use async_trait::async_trait;
use jc_core::{BackendError, ComputeBackendParams, Job};
use openssh::{KnownHosts, Session, Stdio};

use super::{wrapper::build_wrapper_script, BackendPhase, JobBackend};

/// HPC-batch adapter: connects to a Slurm head node over SSH,
/// stages the wrapper script, submits with `sbatch`, and polls with `squeue`/`sacct`.
pub struct HpcBatchBackend {
    host: String,
    user: String,
    remote_scratch_root: String,
}

impl HpcBatchBackend {
    pub fn new(host: String, user: String, remote_scratch_root: String) -> Self {
        Self {
            host,
            user,
            remote_scratch_root,
        }
    }

    async fn connect(&self) -> Result<Session, BackendError> {
        Session::connect(format!("{}@{}", self.user, self.host), KnownHosts::Strict)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))
    }

    fn scratch_dir(&self, job: &Job) -> String {
        format!("{}/{}", self.remote_scratch_root, job.job_id)
    }
}

#[async_trait]
impl JobBackend for HpcBatchBackend {
    async fn submit(&self, job: &Job) -> Result<String, BackendError> {
        let session = self.connect().await?;
        let scratch = self.scratch_dir(job);

        // Idempotent across retries: a prior submission leaves a `.slurm_job_id`
        // marker in the scratch directory.
        let marker_path = format!("{scratch}/.slurm_job_id");
        if let Ok(output) = session
            .command("cat")
            .arg(&marker_path)
            .output()
            .await
        {
            if output.status.success() {
                let existing = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !existing.is_empty() {
                    return Ok(existing);
                }
            }
        }

        session
            .command("mkdir")
            .arg("-p")
            .arg(&scratch)
            .status()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let script = build_wrapper_script(&job.cmd);
        let mut write_script = session
            .command("sh")
            .arg("-c")
            .arg(format!("cat > {scratch}/wrapper.sh && chmod +x {scratch}/wrapper.sh"))
            .stdin(Stdio::piped())
            .spawn()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        {
            use tokio::io::AsyncWriteExt;
            let stdin = write_script.stdin().as_mut().expect("piped stdin");
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| BackendError::Connection(e.to_string()))?;
        }
        write_script
            .wait()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let (partition, time_limit) = match &job.compute_backend_params {
            ComputeBackendParams::HpcBatch(params) => (
                params.slurm_partition.clone(),
                params.slurm_time.clone().unwrap_or_else(|| "01:00:00".to_string()),
            ),
            _ => (None, "01:00:00".to_string()),
        };

        let mut command = session.command("sbatch");
        command
            .arg("--parsable")
            .arg("--job-name")
            .arg(format!("rjc-{}", job.job_id))
            .arg("--time")
            .arg(&time_limit)
            .arg("--chdir")
            .arg(&scratch);
        if let Some(partition) = partition {
            command.arg("--partition").arg(partition);
        }
        command.arg(format!("{scratch}/wrapper.sh"));

        let output = command
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(BackendError::Rejected(format!("sbatch failed: {stderr}")));
        }

        let slurm_job_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if slurm_job_id.is_empty() {
            return Err(BackendError::MalformedResponse("sbatch produced no job id".to_string()));
        }

        session
            .command("sh")
            .arg("-c")
            .arg(format!("echo {slurm_job_id} > {marker_path}"))
            .status()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(slurm_job_id)
    }

    async fn stop(&self, job: &Job) -> Result<(), BackendError> {
        let Some(backend_job_id) = job.backend_job_id.as_ref() else {
            return Ok(());
        };
        let session = self.connect().await?;
        let output = session
            .command("scancel")
            .arg(backend_job_id)
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        // `scancel` on an unknown or already-completed job id still exits 0.
        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::Connection(String::from_utf8_lossy(&output.stderr).to_string()))
        }
    }

    async fn fetch_logs(&self, job: &Job) -> Result<String, BackendError> {
        let session = self.connect().await?;
        let scratch = self.scratch_dir(job);
        let output = session
            .command("sh")
            .arg("-c")
            .arg(format!("cat {scratch}/slurm-*.out 2>/dev/null"))
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<BackendPhase, BackendError> {
        let session = self.connect().await?;
        let output = session
            .command("squeue")
            .arg("-h")
            .arg("-j")
            .arg(backend_job_id)
            .arg("-o")
            .arg("%T")
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !state.is_empty() {
            return Ok(classify_squeue_state(&state));
        }

        // Not in the live queue any more; fall back to `sacct` for the final state.
        let output = session
            .command("sacct")
            .arg("-n")
            .arg("-P")
            .arg("--format=State")
            .arg("-j")
            .arg(backend_job_id)
            .output()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let state = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        Ok(classify_sacct_state(&state))
    }
}

fn classify_squeue_state(state: &str) -> BackendPhase {
    match state {
        "RUNNING" | "COMPLETING" => BackendPhase::Running,
        "PENDING" | "CONFIGURING" => BackendPhase::Unknown,
        _ => BackendPhase::Unknown,
    }
}

fn classify_sacct_state(state: &str) -> BackendPhase {
    match state {
        "COMPLETED" => BackendPhase::Finished,
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" => BackendPhase::Failed,
        "CANCELLED" => BackendPhase::Failed,
        "" | "PENDING" | "RUNNING" => BackendPhase::Unknown,
        _ => BackendPhase::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squeue_running_maps_to_running() {
        assert_eq!(classify_squeue_state("RUNNING"), BackendPhase::Running);
    }

    #[test]
    fn sacct_completed_maps_to_finished() {
        assert_eq!(classify_sacct_state("COMPLETED"), BackendPhase::Finished);
    }

    #[test]
    fn sacct_out_of_memory_maps_to_failed() {
        assert_eq!(classify_sacct_state("OUT_OF_MEMORY"), BackendPhase::Failed);
    }
}
