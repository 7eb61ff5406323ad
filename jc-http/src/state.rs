use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use jc_core::Settings;
use jc_queue::{Db, JobCache, JobManager, Registry};
use tokio::sync::Mutex;

/// Shared handle every handler extracts from axum's `State`. `monitor_set`
/// is taken exactly once, by `/shutdown`.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub registry: Registry,
    pub cache: Arc<JobCache>,
    pub db: Db,
    pub workspace_root: PathBuf,
    pub job_logs_max_bytes: usize,
    pub accepting_submissions: Arc<AtomicBool>,
    pub monitor_set: Arc<Mutex<Option<jc_queue::MonitorSet>>>,
    pub shutdown_deadline: std::time::Duration,
}

impl AppState {
    pub fn new(
        manager: JobManager,
        registry: Registry,
        cache: JobCache,
        db: Db,
        settings: &Settings,
        monitor_set: jc_queue::MonitorSet,
    ) -> Self {
        Self {
            manager: Arc::new(manager),
            registry,
            cache: Arc::new(cache),
            db,
            workspace_root: PathBuf::from(&settings.workspace_root),
            job_logs_max_bytes: settings.job_logs_max_bytes,
            accepting_submissions: Arc::new(AtomicBool::new(true)),
            monitor_set: Arc::new(Mutex::new(Some(monitor_set))),
            shutdown_deadline: settings.shutdown_deadline,
        }
    }
}
