use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use jc_core::{Backend, LogFormat, Settings};
use jc_queue::backend::{hpc_batch::HpcBatchBackend, htc_grid::HtcGridBackend, kubernetes::KubernetesBackend, remote_htc::RemoteHtcBackend};
use jc_queue::{Db, JobBackend, JobCache, JobManager, Monitor, MonitorSet, Registry};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn build_backend(backend: Backend) -> Arc<dyn JobBackend> {
    match backend {
        Backend::Kubernetes => Arc::new(KubernetesBackend::new(
            env_or("REANA_RUNTIME_KUBERNETES_NAMESPACE", "default"),
            env_or("REANA_KUBERNETES_JOBS_MEMORY_LIMIT", "1Gi"),
        )),
        Backend::HpcBatch => Arc::new(HpcBatchBackend::new(
            env_or("REANA_HPC_BATCH_HOST", "localhost"),
            env_or("REANA_HPC_BATCH_USER", "reana"),
            env_or("REANA_HPC_BATCH_SCRATCH_ROOT", "/scratch/reana"),
        )),
        Backend::HtcGrid => Arc::new(HtcGridBackend::new(PathBuf::from(env_or(
            "REANA_HTC_GRID_SCRATCH_ROOT",
            "/var/lib/condor/reana",
        )))),
        Backend::RemoteHtc => Arc::new(RemoteHtcBackend::new(
            env_or("REANA_REMOTE_HTC_GATEWAY_URL", "http://localhost:8088"),
            env_or("REANA_REMOTE_HTC_TOKEN_ISSUER_URL", "http://localhost:8089"),
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().map_err(|e| anyhow::anyhow!(e))?;
    init_tracing(settings.log_format);

    tracing::info!(port = settings.http_port, backends = ?settings.compute_backends, "starting job controller");

    let db = Db::connect(&settings.database_url).await?;
    let registry = Registry::new();
    let workspace_root = PathBuf::from(&settings.workspace_root);
    let cache = JobCache::new(db.clone(), workspace_root.clone());

    // Recover jobs left non-terminal by a previous crash: republish them so the Monitors pick up where they left off.
    for job in db.list_non_terminal_jobs().await? {
        let job_id = job.job_id.clone();
        if let Err(e) = registry.insert(job) {
            tracing::warn!(%job_id, error = %e, "failed to recover job into registry on startup");
        }
    }

    let mut backends: HashMap<Backend, Arc<dyn JobBackend>> = HashMap::new();
    let mut monitors = Vec::new();
    for &backend in &settings.compute_backends {
        let adapter = build_backend(backend);
        monitors.push(Monitor::new(
            backend,
            adapter.clone(),
            registry.clone(),
            db.clone(),
            cache.clone(),
            settings.monitor_poll_interval,
            settings.job_logs_max_bytes,
        ));
        backends.insert(backend, adapter);
    }

    let manager = JobManager::new(
        backends,
        registry.clone(),
        db.clone(),
        cache.clone(),
        workspace_root,
        settings.job_logs_max_bytes,
    );

    let monitor_set = MonitorSet::spawn(monitors);
    let state = jc_http::AppState::new(manager, registry, cache, db, &settings, monitor_set);
    let router = jc_http::build_router(state);

    let addr = format!("0.0.0.0:{}", settings.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        tracing::info!("shutdown signal received");
    };

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal).await?;

    Ok(())
}
