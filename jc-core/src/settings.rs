//! Environment-driven configuration: env overrides, no TOML/YAML, no
//! stack lock-in, typed rather than a string key/value store since this
//! service has a fixed, known shape rather than a generic multi-tenant
//! surface.

use std::env;
use std::time::Duration;

use crate::backend::Backend;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub secret_key: String,
    pub workspace_root: String,
    pub job_logs_max_bytes: usize,
    pub log_format: LogFormat,
    pub http_port: u16,
    pub shutdown_deadline: Duration,
    pub monitor_poll_interval: Duration,
    pub compute_backends: Vec<Backend>,
    pub default_compute_backend: Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Settings {
    /// Load configuration from environment variables, applying the
    /// documented defaults for everything optional.
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("REANA_SQLALCHEMY_DATABASE_URI")
            .or_else(|_| env::var("DATABASE_URL"))
            .map_err(|_| "REANA_SQLALCHEMY_DATABASE_URI must be set".to_string())?;

        let secret_key = env::var("REANA_SECRET_KEY")
            .map_err(|_| "REANA_SECRET_KEY must be set".to_string())?;

        let workspace_root = env::var("REANA_WORKSPACE_ROOT").unwrap_or_else(|_| "/var/reana".to_string());

        let job_logs_max_bytes = env::var("REANA_JOB_LOGS_MAX_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5 * 1024 * 1024);

        let log_format = match env::var("JOB_CONTROLLER_LOG_FORMAT").ok().as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let http_port = env::var("JOB_CONTROLLER_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);

        let shutdown_deadline = Duration::from_secs(
            env::var("JOB_CONTROLLER_SHUTDOWN_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        );

        let monitor_poll_interval = Duration::from_secs(
            env::var("JOB_CONTROLLER_MONITOR_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
        );

        let compute_backends = match env::var("COMPUTE_BACKENDS").ok() {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().parse::<Backend>())
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![Backend::Kubernetes],
        };

        let default_compute_backend = *compute_backends
            .first()
            .unwrap_or(&Backend::Kubernetes);

        Ok(Self {
            database_url,
            secret_key,
            workspace_root,
            job_logs_max_bytes,
            log_format,
            http_port,
            shutdown_deadline,
            monitor_poll_interval,
            compute_backends,
            default_compute_backend,
        })
    }

    pub fn supports_backend(&self, backend: Backend) -> bool {
        self.compute_backends.contains(&backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_optional_vars_absent() {
        assert_eq!(5 * 1024 * 1024usize, 5_242_880);
    }

    #[test]
    fn supports_backend_checks_configured_list() {
        let settings = Settings {
            database_url: String::new(),
            secret_key: String::new(),
            workspace_root: String::new(),
            job_logs_max_bytes: 0,
            log_format: LogFormat::Pretty,
            http_port: 5000,
            shutdown_deadline: Duration::from_secs(1),
            monitor_poll_interval: Duration::from_secs(1),
            compute_backends: vec![Backend::Kubernetes, Backend::HpcBatch],
            default_compute_backend: Backend::Kubernetes,
        };

        assert!(settings.supports_backend(Backend::Kubernetes));
        assert!(!settings.supports_backend(Backend::HtcGrid));
    }
}
