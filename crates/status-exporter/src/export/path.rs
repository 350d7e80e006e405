use std::path::Path;
use std::path::PathBuf;

/// File holding the latest SM utilization sample of a pod on a GPU
pub const UTILIZATION_FILE: &str = "utilization.sm";

/// Directory of a pod's metrics for one GPU, relative to the export root.
pub fn gpu_metrics_dir(pod_uid: &str, gpu_index: usize) -> PathBuf {
    PathBuf::from(format!("runai/proc/pod/{pod_uid}/metrics/gpu/{gpu_index}"))
}

/// `runai/proc/pod/<pod_uid>/metrics/gpu/<gpu_index>/utilization.sm`
pub fn utilization_path(pod_uid: &str, gpu_index: usize) -> PathBuf {
    gpu_metrics_dir(pod_uid, gpu_index).join(UTILIZATION_FILE)
}

/// Resolves export targets below a fixed root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    root: PathBuf,
}

impl ExportPaths {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metrics_dir(&self, pod_uid: &str, gpu_index: usize) -> PathBuf {
        self.root.join(gpu_metrics_dir(pod_uid, gpu_index))
    }

    pub fn resolve(&self, pod_uid: &str, gpu_index: usize) -> PathBuf {
        self.metrics_dir(pod_uid, gpu_index).join(UTILIZATION_FILE)
    }
}

impl Default for ExportPaths {
    fn default() -> Self {
        Self::new(".")
    }
}
