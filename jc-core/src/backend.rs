use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The compute backend a job is routed to. One polymorphic contract (see `jc-queue::backend`)
/// is implemented once per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Kubernetes,
    HtcGrid,
    HpcBatch,
    RemoteHtc,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::HtcGrid => "htc-grid",
            Self::HpcBatch => "hpc-batch",
            Self::RemoteHtc => "remote-htc",
        }
    }

    pub fn all() -> &'static [Backend] {
        &[Self::Kubernetes, Self::HtcGrid, Self::HpcBatch, Self::RemoteHtc]
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "htc-grid" | "htcondor" => Ok(Self::HtcGrid),
            "hpc-batch" | "slurm" => Ok(Self::HpcBatch),
            "remote-htc" => Ok(Self::RemoteHtc),
            other => Err(format!("unknown compute backend: {other}")),
        }
    }
}

/// Per-backend parameter bag. Parsed once at the HTTP boundary into a typed variant
/// so malformed backend params are rejected before any backend call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesParams {
    pub kubernetes_uid: Option<i64>,
    pub kubernetes_memory_limit: Option<String>,
    pub kubernetes_job_timeout: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HtcGridParams {
    pub htcondor_accounting_group: Option<String>,
    pub htcondor_max_runtime: Option<i64>,
    pub unpacked_img: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HpcBatchParams {
    pub slurm_partition: Option<String>,
    pub slurm_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteHtcParams {
    pub c4p_cpu_cores: Option<i64>,
    pub c4p_memory_limit: Option<String>,
    pub c4p_additional_requirements: Option<String>,
}

/// Tagged-variant over backend, one typed struct per variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum ComputeBackendParams {
    Kubernetes(KubernetesParams),
    HtcGrid(HtcGridParams),
    HpcBatch(HpcBatchParams),
    RemoteHtc(RemoteHtcParams),
}

impl ComputeBackendParams {
    pub fn backend(&self) -> Backend {
        match self {
            Self::Kubernetes(_) => Backend::Kubernetes,
            Self::HtcGrid(_) => Backend::HtcGrid,
            Self::HpcBatch(_) => Backend::HpcBatch,
            Self::RemoteHtc(_) => Backend::RemoteHtc,
        }
    }

    pub fn empty_for(backend: Backend) -> Self {
        match backend {
            Backend::Kubernetes => Self::Kubernetes(KubernetesParams::default()),
            Backend::HtcGrid => Self::HtcGrid(HtcGridParams::default()),
            Backend::HpcBatch => Self::HpcBatch(HpcBatchParams::default()),
            Backend::RemoteHtc => Self::RemoteHtc(RemoteHtcParams::default()),
        }
    }
}
