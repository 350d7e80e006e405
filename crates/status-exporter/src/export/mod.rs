//! Export of sampled utilization to the filesystem.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use topology::RESERVATION_NAMESPACE;

pub mod fs;
pub mod path;

pub use fs::ExportSummary;
pub use fs::FsExporter;
pub use fs::SubscribedExporter;
pub use path::ExportPaths;

/// Exporter settings
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Directory the `runai/...` tree is created in
    pub root: PathBuf,
    /// Only GPUs allocated from this namespace are exported
    pub reservation_namespace: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            reservation_namespace: RESERVATION_NAMESPACE.to_string(),
        }
    }
}

/// Failure to export a single pod/GPU pair. Never aborts a snapshot.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Pod UID `{0}` is not usable as a path component")]
    InvalidPodUid(String),

    #[error("Failed to create directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}
