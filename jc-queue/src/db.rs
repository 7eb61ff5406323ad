use std::str::FromStr;

use chrono::{DateTime, Utc};
use jc_core::{Backend, DbError, Job, JobControllerError, JobId, JobStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A cache row as persisted in the `job_cache` table.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub fingerprint: String,
    pub result_path: String,
    pub access_timestamp: DateTime<Utc>,
}

/// Thin wrapper over the `job` and `job_cache` tables, mirroring the one-commit-per-transition
/// discipline required by the concurrency model.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Connect and run migrations. `database_url` is expected to be a `sqlite:` URL;
    /// a file-backed store is used in production, `sqlite::memory:` in tests.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DbError::Query(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self { pool })
    }

    pub async fn connect_in_memory() -> Result<Self, DbError> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn insert_job(&self, job: &Job) -> Result<(), JobControllerError> {
        sqlx::query(
            "INSERT INTO job (id, backend, backend_job_id, workflow_uuid, workspace, docker_image, cmd, status, logs, cache_key, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.job_id.to_string())
        .bind(job.backend.name())
        .bind(&job.backend_job_id)
        .bind(&job.workflow_uuid)
        .bind(&job.workflow_workspace)
        .bind(&job.docker_image)
        .bind(&job.cmd)
        .bind(job.status.name())
        .bind(&job.logs)
        .bind(&job.cache_key)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        logs: &str,
        backend_job_id: Option<&str>,
    ) -> Result<(), JobControllerError> {
        sqlx::query(
            "UPDATE job SET status = ?, logs = ?, backend_job_id = COALESCE(?, backend_job_id), updated_at = ? WHERE id = ?",
        )
        .bind(status.name())
        .bind(logs)
        .bind(backend_job_id)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, JobControllerError> {
        let row = sqlx::query(
            "SELECT id, backend, backend_job_id, workflow_uuid, workspace, docker_image, cmd, status, logs, cache_key, created_at, updated_at \
             FROM job WHERE id = ?",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

        row.map(row_to_job).transpose()
    }

    pub async fn list_non_terminal_jobs(&self) -> Result<Vec<Job>, JobControllerError> {
        let rows = sqlx::query(
            "SELECT id, backend, backend_job_id, workflow_uuid, workspace, docker_image, cmd, status, logs, cache_key, created_at, updated_at \
             FROM job WHERE status NOT IN ('finished', 'failed', 'stopped')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn get_cache_row(&self, fingerprint: &str) -> Result<Option<CacheRow>, JobControllerError> {
        let row = sqlx::query("SELECT fingerprint, result_path, access_timestamp FROM job_cache WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };

        let access_timestamp: String = row.try_get("access_timestamp").map_err(|e| DbError::Query(e.to_string()))?;
        Ok(Some(CacheRow {
            fingerprint: row.try_get("fingerprint").map_err(|e| DbError::Query(e.to_string()))?,
            result_path: row.try_get("result_path").map_err(|e| DbError::Query(e.to_string()))?,
            access_timestamp: parse_timestamp(&access_timestamp)?,
        }))
    }

    /// Insert or overwrite the cache row for `fingerprint`.
    pub async fn upsert_cache_row(&self, fingerprint: &str, result_path: &str) -> Result<(), JobControllerError> {
        sqlx::query(
            "INSERT INTO job_cache (fingerprint, result_path, access_timestamp) VALUES (?, ?, ?) \
             ON CONFLICT(fingerprint) DO UPDATE SET result_path = excluded.result_path, access_timestamp = excluded.access_timestamp",
        )
        .bind(fingerprint)
        .bind(result_path)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

        Ok(())
    }
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<Job, JobControllerError> {
    let id: String = row.try_get("id").map_err(|e| DbError::Query(e.to_string()))?;
    let backend: String = row.try_get("backend").map_err(|e| DbError::Query(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| DbError::Query(e.to_string()))?;
    let created_at: String = row.try_get("created_at").map_err(|e| DbError::Query(e.to_string()))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| DbError::Query(e.to_string()))?;
    let backend_job_id: Option<String> = row.try_get("backend_job_id").map_err(|e| DbError::Query(e.to_string()))?;
    let workflow_uuid: String = row.try_get("workflow_uuid").map_err(|e| DbError::Query(e.to_string()))?;
    let workspace: String = row.try_get("workspace").map_err(|e| DbError::Query(e.to_string()))?;
    let docker_image: String = row.try_get("docker_image").map_err(|e| DbError::Query(e.to_string()))?;
    let cmd: String = row.try_get("cmd").map_err(|e| DbError::Query(e.to_string()))?;
    let logs: String = row.try_get("logs").map_err(|e| DbError::Query(e.to_string()))?;
    let cache_key: Option<String> = row.try_get("cache_key").map_err(|e| DbError::Query(e.to_string()))?;

    let job_id = JobId::from(Uuid::parse_str(&id).map_err(|e| DbError::Query(e.to_string()))?);
    let backend = Backend::from_str(&backend).map_err(DbError::Query)?;
    let status = JobStatus::from_str(&status).map_err(DbError::Query)?;

    Ok(Job {
        job_id,
        backend,
        backend_job_id,
        workflow_uuid,
        workflow_workspace: workspace,
        docker_image,
        cmd,
        env: Default::default(),
        status,
        logs,
        compute_backend_params: jc_core::ComputeBackendParams::empty_for(backend),
        cvmfs_mounts: None,
        cache_key,
        restart_count: 0,
        max_restart_count: 3,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, JobControllerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Query(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jc_core::JobRequest;
    use std::collections::HashMap;

    fn request() -> JobRequest {
        JobRequest {
            docker_img: "busybox".to_string(),
            job_name: "j1".to_string(),
            workflow_uuid: "w1".to_string(),
            workflow_workspace: "/w/w1".to_string(),
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

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let db = Db::connect_in_memory().await.unwrap();
        let job = Job::new(JobId::new(), &request());
        let job_id = job.job_id.clone();

        db.insert_job(&job).await.unwrap();
        let fetched = db.get_job(&job_id).await.unwrap().unwrap();

        assert_eq!(fetched.job_id, job_id);
        assert_eq!(fetched.docker_image, "busybox");
        assert_eq!(fetched.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn update_job_status_persists_logs_and_transition() {
        let db = Db::connect_in_memory().await.unwrap();
        let job = Job::new(JobId::new(), &request());
        let job_id = job.job_id.clone();
        db.insert_job(&job).await.unwrap();

        db.update_job_status(&job_id, JobStatus::Running, "started\n", Some("pod-a"))
            .await
            .unwrap();

        let fetched = db.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Running);
        assert_eq!(fetched.logs, "started\n");
        assert_eq!(fetched.backend_job_id.as_deref(), Some("pod-a"));
    }

    #[tokio::test]
    async fn cache_row_upsert_then_lookup() {
        let db = Db::connect_in_memory().await.unwrap();
        assert!(db.get_cache_row("abc").await.unwrap().is_none());

        db.upsert_cache_row("abc", "/w/w1/archive/abc").await.unwrap();
        let row = db.get_cache_row("abc").await.unwrap().unwrap();
        assert_eq!(row.result_path, "/w/w1/archive/abc");

        db.upsert_cache_row("abc", "/w/w1/archive/abc-v2").await.unwrap();
        let row = db.get_cache_row("abc").await.unwrap().unwrap();
        assert_eq!(row.result_path, "/w/w1/archive/abc-v2");
    }

    #[tokio::test]
    async fn list_non_terminal_jobs_excludes_finished() {
        let db = Db::connect_in_memory().await.unwrap();
        let running = Job::new(JobId::new(), &request());
        let mut finished = Job::new(JobId::new(), &request());
        finished.status = JobStatus::Finished;

        db.insert_job(&running).await.unwrap();
        db.insert_job(&finished).await.unwrap();

        let pending = db.list_non_terminal_jobs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, running.job_id);
    }
}
