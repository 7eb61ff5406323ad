use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use jc_core::{CacheError, ComputeBackendParams, JobControllerError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::db::Db;

const LOCK_RETRY_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The inputs that determine whether two job submissions are cache-equivalent.
#[derive(Debug, Serialize)]
pub struct CacheSpec<'a> {
    pub cmd: &'a str,
    pub docker_image: &'a str,
    pub env: &'a std::collections::HashMap<String, String>,
    pub compute_backend_params: &'a ComputeBackendParams,
    pub workflow_json: &'a serde_json::Value,
    pub input_files_digest_map: &'a serde_json::Value,
}

/// Hash the canonical (key-sorted) JSON form of `spec`. `serde_json`'s map
/// serialization is already key-sorted for `BTreeMap`/struct fields in
/// declaration order; we re-serialize through `serde_json::Value` to force
/// sorted object keys regardless of input ordering.
pub fn fingerprint(spec: &CacheSpec<'_>) -> Result<String, JobControllerError> {
    let value = serde_json::to_value(spec).map_err(|e| JobControllerError::Malformed(e.to_string()))?;
    let canonical = canonicalize(&value);
    let bytes = serde_json::to_vec(&canonical).map_err(|e| JobControllerError::Malformed(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, serde_json::Value> = std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Content-addressed result cache. The archive directory for a given
/// fingerprint lives at `<workspace_root>/archive/<fingerprint>/`.
#[derive(Clone)]
pub struct JobCache {
    db: Db,
    workspace_root: PathBuf,
}

impl JobCache {
    pub fn new(db: Db, workspace_root: PathBuf) -> Self {
        Self { db, workspace_root }
    }

    fn archive_dir(&self, fingerprint: &str) -> PathBuf {
        self.workspace_root.join("archive").join(fingerprint)
    }

    fn lock_path(&self, fingerprint: &str) -> PathBuf {
        self.workspace_root.join("archive").join(format!("{fingerprint}.lock"))
    }

    /// Look up a cache hit. Readers never take the advisory lock.
    #[instrument(skip(self))]
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<String>, JobControllerError> {
        let row = self.db.get_cache_row(fingerprint).await?;
        Ok(row.map(|r| r.result_path))
    }

    /// Copy the archived result into `workspace`.
    #[instrument(skip(self))]
    pub async fn hydrate(&self, result_path: &str, workspace: &Path) -> Result<(), JobControllerError> {
        let result_path = PathBuf::from(result_path);
        let workspace = workspace.to_path_buf();

        tokio::task::spawn_blocking(move || copy_dir_recursive(&result_path, &workspace))
            .await
            .map_err(|e| CacheError::Io(io::Error::other(e.to_string())))?
            .map_err(CacheError::Io)?;

        Ok(())
    }

    /// Archive `workspace` under a fresh directory for `fingerprint` and upsert
    /// the cache row, holding a per-fingerprint exclusive advisory lock across
    /// the write.
    #[instrument(skip(self))]
    pub async fn archive(&self, fingerprint: &str, workspace: &Path) -> Result<String, JobControllerError> {
        let archive_root = self.workspace_root.join("archive");
        tokio::fs::create_dir_all(&archive_root)
            .await
            .map_err(CacheError::Io)?;

        let lock_path = self.lock_path(fingerprint);
        let final_dir = self.archive_dir(fingerprint);
        let temp_dir = self.workspace_root.join("archive").join(format!("{fingerprint}.tmp"));
        let workspace = workspace.to_path_buf();

        let result_path = tokio::task::spawn_blocking(move || -> Result<String, CacheError> {
            let lock_file = File::create(&lock_path)?;
            acquire_lock(&lock_file)?;

            if temp_dir.exists() {
                std::fs::remove_dir_all(&temp_dir)?;
            }
            copy_dir_recursive(&workspace, &temp_dir)?;

            if final_dir.exists() {
                std::fs::remove_dir_all(&final_dir)?;
            }
            std::fs::rename(&temp_dir, &final_dir)?;

            fs2::FileExt::unlock(&lock_file)?;
            Ok(final_dir.to_string_lossy().to_string())
        })
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e.to_string())))??;

        self.db.upsert_cache_row(fingerprint, &result_path).await?;
        debug!(fingerprint, result_path, "archived workspace to cache");

        Ok(result_path)
    }
}

fn acquire_lock(file: &File) -> Result<(), CacheError> {
    for _ in 0..LOCK_RETRY_ATTEMPTS {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(_) => std::thread::sleep(LOCK_RETRY_DELAY),
        }
    }
    Err(CacheError::Locked(
        "archive lock contended after maximum retries".to_string(),
    ))
}

fn copy_dir_recursive(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest = to.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
