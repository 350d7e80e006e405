use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use topology::NodeTopology;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ExportConfig;
use super::ExportError;
use super::ExportPaths;
use crate::sampler::RandomSampler;
use crate::sampler::UtilizationSampler;
use crate::watch::TopologyReceiver;
use crate::watch::TopologySource;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const TMP_FILE: &str = ".utilization.sm.tmp";

/// Outcome counters of one exported snapshot
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    /// Pod/GPU pairs written
    pub exported: usize,
    /// GPUs not allocated from the reservation namespace
    pub skipped_gpus: usize,
    /// Pod/GPU pairs that could not be written
    pub failed: usize,
}

/// Writes the utilization of every reserved pod/GPU pair to
/// `<root>/runai/proc/pod/<pod>/metrics/gpu/<index>/utilization.sm`.
///
/// Files of pods that disappear from later snapshots are left in place.
pub struct FsExporter {
    paths: ExportPaths,
    reservation_namespace: String,
    sampler: Box<dyn UtilizationSampler>,
}

impl FsExporter {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            paths: ExportPaths::new(config.root),
            reservation_namespace: config.reservation_namespace,
            sampler: Box::new(RandomSampler),
        }
    }

    /// Subscribes to `source` right away, so nothing it publishes from now on
    /// is missed before [`SubscribedExporter::run`] starts.
    pub fn from_source<S: TopologySource + ?Sized>(
        source: &S,
        config: ExportConfig,
    ) -> SubscribedExporter {
        Self::new(config).subscribe(source)
    }

    pub fn subscribe<S: TopologySource + ?Sized>(self, source: &S) -> SubscribedExporter {
        SubscribedExporter {
            receiver: source.subscribe(),
            exporter: self,
        }
    }

    pub fn with_sampler<S: UtilizationSampler + 'static>(mut self, sampler: S) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    pub fn paths(&self) -> &ExportPaths {
        &self.paths
    }

    /// Exports snapshots one by one until cancelled or the source closes.
    ///
    /// Cancellation is checked between snapshots, an export in progress is
    /// always finished.
    pub async fn run(
        &self,
        mut receiver: TopologyReceiver,
        cancellation_token: CancellationToken,
    ) {
        info!(
            root = %self.paths.root().display(),
            namespace = %self.reservation_namespace,
            "Starting filesystem exporter"
        );

        loop {
            select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Filesystem exporter shutdown requested");
                    break;
                }
                topology = receiver.recv() => {
                    let Some(topology) = topology else {
                        info!("Topology source closed, stopping filesystem exporter");
                        break;
                    };
                    let summary = self.export_snapshot(&topology).await;
                    if summary.failed > 0 {
                        warn!(?summary, "Exported node topology with failures");
                    } else {
                        debug!(?summary, "Exported node topology");
                    }
                }
            }
        }
    }

    /// Samples and writes every pod of every reserved GPU in `topology`.
    pub async fn export_snapshot(&self, topology: &NodeTopology) -> ExportSummary {
        let mut summary = ExportSummary::default();

        for (gpu_index, gpu) in topology.gpus.iter().enumerate() {
            // pods outside the reservation namespace are not visible to the container toolkit
            if !gpu.status.is_allocated_from(&self.reservation_namespace) {
                summary.skipped_gpus += 1;
                continue;
            }

            for (pod_uid, usage) in &gpu.status.pod_gpu_usage_status {
                let utilization = self.sampler.sample(usage);
                debug!(
                    pod_uid = %pod_uid,
                    gpu_index,
                    utilization,
                    "Exporting pod gpu utilization to filesystem"
                );

                match self.export_utilization(pod_uid, gpu_index, utilization).await {
                    Ok(()) => summary.exported += 1,
                    Err(e) => {
                        warn!(
                            pod_uid = %pod_uid,
                            gpu_index,
                            "Failed exporting pod to filesystem: {e}"
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        summary
    }

    async fn export_utilization(
        &self,
        pod_uid: &str,
        gpu_index: usize,
        utilization: u32,
    ) -> Result<(), ExportError> {
        if !is_path_component(pod_uid) {
            return Err(ExportError::InvalidPodUid(pod_uid.to_string()));
        }

        let dir = self.paths.metrics_dir(pod_uid, gpu_index);
        create_dir_all(&dir).await.map_err(|source| ExportError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let path = self.paths.resolve(pod_uid, gpu_index);
        let tmp_path = dir.join(TMP_FILE);
        if let Err(source) =
            write_replace(&tmp_path, &path, utilization.to_string().as_bytes()).await
        {
            return Err(ExportError::Write { path, source });
        }
        Ok(())
    }
}

/// An exporter bound to its topology subscription
pub struct SubscribedExporter {
    exporter: FsExporter,
    receiver: TopologyReceiver,
}

impl SubscribedExporter {
    pub fn exporter(&self) -> &FsExporter {
        &self.exporter
    }

    pub async fn run(self, cancellation_token: CancellationToken) {
        self.exporter.run(self.receiver, cancellation_token).await;
    }
}

fn is_path_component(pod_uid: &str) -> bool {
    !pod_uid.is_empty() && pod_uid != "." && pod_uid != ".." && !pod_uid.contains(['/', '\0'])
}

async fn create_dir_all(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(dir).await
}

/// Writes `content` next to `path` and renames it over `path`, so readers see
/// either the previous or the new value.
async fn write_replace(tmp_path: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let result = async {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(FILE_MODE);

        let mut file = options.open(tmp_path).await?;
        file.write_all(content).await?;
        file.flush().await?;
        drop(file);

        fs::rename(tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(tmp_path).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;
    use topology::GpuDetails;
    use topology::GpuStatus;
    use topology::GpuUsageStatus;
    use topology::Range;
    use topology::RESERVATION_NAMESPACE;

    use super::*;
    use crate::watch::TopologyPublisher;

    fn gpu(namespace: &str, pods: &[(&str, u32)]) -> GpuDetails {
        let mut status = GpuStatus::default();
        status.allocated_by.namespace = namespace.to_string();
        status.pod_gpu_usage_status = pods
            .iter()
            .map(|(pod, value)| {
                (
                    pod.to_string(),
                    GpuUsageStatus {
                        utilization: Range::new(*value, *value),
                        ..Default::default()
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        GpuDetails {
            id: format!("GPU-{namespace}"),
            status,
        }
    }

    fn exporter(root: &Path) -> FsExporter {
        FsExporter::new(ExportConfig {
            root: root.to_path_buf(),
            ..Default::default()
        })
    }

    fn read(root: &Path, pod: &str, gpu_index: usize) -> String {
        let path = ExportPaths::new(root).resolve(pod, gpu_index);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {path:?}: {e}"))
    }

    #[test(tokio::test)]
    async fn writes_decimal_without_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("pod-123", 42)])],
            ..Default::default()
        };

        let summary = exporter(dir.path()).export_snapshot(&topology).await;

        assert_eq!(summary, ExportSummary { exported: 1, skipped_gpus: 0, failed: 0 });
        assert_eq!(read(dir.path(), "pod-123", 0), "42");
    }

    #[test(tokio::test)]
    async fn content_format_for_range_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("zero", 0), ("seven", 7), ("full", 100)])],
            ..Default::default()
        };

        exporter(dir.path()).export_snapshot(&topology).await;

        assert_eq!(read(dir.path(), "zero", 0), "0");
        assert_eq!(read(dir.path(), "seven", 0), "7");
        assert_eq!(read(dir.path(), "full", 0), "100");
    }

    #[test(tokio::test)]
    async fn skips_foreign_namespaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let topology = NodeTopology {
            gpus: vec![
                gpu("user-ns", &[("pod-123", 42)]),
                gpu("", &[("pod-456", 10)]),
                gpu(RESERVATION_NAMESPACE, &[("pod-789", 5)]),
            ],
            ..Default::default()
        };

        let summary = exporter(dir.path()).export_snapshot(&topology).await;

        assert_eq!(summary, ExportSummary { exported: 1, skipped_gpus: 2, failed: 0 });
        let pods = dir.path().join("runai/proc/pod");
        assert!(!pods.join("pod-123").exists());
        assert!(!pods.join("pod-456").exists());
        assert_eq!(read(dir.path(), "pod-789", 2), "5");
    }

    #[test(tokio::test)]
    async fn namespace_is_injected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exporter = FsExporter::new(ExportConfig {
            root: dir.path().to_path_buf(),
            reservation_namespace: "custom-ns".to_string(),
        });
        let topology = NodeTopology {
            gpus: vec![
                gpu(RESERVATION_NAMESPACE, &[("default-pod", 1)]),
                gpu("custom-ns", &[("custom-pod", 2)]),
            ],
            ..Default::default()
        };

        let summary = exporter.export_snapshot(&topology).await;

        assert_eq!(summary.exported, 1);
        assert_eq!(summary.skipped_gpus, 1);
        assert_eq!(read(dir.path(), "custom-pod", 1), "2");
    }

    #[test(tokio::test)]
    async fn overwrite_leaves_single_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counter = Arc::new(AtomicU32::new(10));
        let exporter = {
            let counter = counter.clone();
            exporter(dir.path()).with_sampler(move |_: &GpuUsageStatus| {
                counter.fetch_add(67, Ordering::SeqCst)
            })
        };
        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("pod-123", 0)])],
            ..Default::default()
        };

        exporter.export_snapshot(&topology).await;
        assert_eq!(read(dir.path(), "pod-123", 0), "10");
        exporter.export_snapshot(&topology).await;
        assert_eq!(read(dir.path(), "pod-123", 0), "77");

        let gpu_dir = exporter.paths().metrics_dir("pod-123", 0);
        let entries = std::fs::read_dir(&gpu_dir)
            .expect("read gpu dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec![std::ffi::OsString::from("utilization.sm")]);
    }

    #[test(tokio::test)]
    async fn failure_does_not_stop_other_pods() {
        let dir = tempfile::tempdir().expect("tempdir");
        // a plain file where pod-A's directory should go
        let blocked = dir.path().join("runai/proc/pod");
        std::fs::create_dir_all(&blocked).expect("create pod dir");
        std::fs::write(blocked.join("pod-A"), "").expect("create blocker");

        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("pod-A", 11), ("pod-B", 22)])],
            ..Default::default()
        };

        let summary = exporter(dir.path()).export_snapshot(&topology).await;

        assert_eq!(summary, ExportSummary { exported: 1, skipped_gpus: 0, failed: 1 });
        assert_eq!(read(dir.path(), "pod-B", 0), "22");
    }

    #[test(tokio::test)]
    async fn rejects_pod_uids_escaping_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("../../escape", 1), ("..", 2), ("ok", 3)])],
            ..Default::default()
        };

        let summary = exporter(dir.path()).export_snapshot(&topology).await;

        assert_eq!(summary.exported, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(read(dir.path(), "ok", 0), "3");
    }

    #[cfg(unix)]
    #[test(tokio::test)]
    async fn creates_traversable_directories() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("pod-123", 42)])],
            ..Default::default()
        };

        let exporter = exporter(dir.path());
        exporter.export_snapshot(&topology).await;

        let gpu_dir = exporter.paths().metrics_dir("pod-123", 0);
        let mode = std::fs::metadata(&gpu_dir).expect("metadata").permissions().mode();
        // owner can always traverse, umask may only clear bits
        assert_eq!(mode & 0o700, 0o700);
        let file_mode = std::fs::metadata(exporter.paths().resolve("pod-123", 0))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o111, 0);
    }

    #[test(tokio::test)]
    async fn write_failure_cleans_up_and_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exporter = exporter(dir.path());
        // directory creation succeeds, the rename over a directory does not
        let blocked = exporter.paths().resolve("pod-A", 0);
        std::fs::create_dir_all(&blocked).expect("create blocking dir");

        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("pod-A", 1), ("pod-B", 2)])],
            ..Default::default()
        };

        let summary = exporter.export_snapshot(&topology).await;

        assert_eq!(summary, ExportSummary { exported: 1, skipped_gpus: 0, failed: 1 });
        assert!(blocked.is_dir());
        assert!(!exporter.paths().metrics_dir("pod-A", 0).join(TMP_FILE).exists());
        assert_eq!(read(dir.path(), "pod-B", 0), "2");
    }

    #[test(tokio::test)]
    async fn write_failure_reports_target_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exporter = exporter(dir.path());
        let blocked = exporter.paths().resolve("pod-A", 0);
        std::fs::create_dir_all(&blocked).expect("create blocking dir");

        let err = exporter
            .export_utilization("pod-A", 0, 1)
            .await
            .expect_err("should fail to replace a directory");

        match err {
            ExportError::Write { path, .. } => assert_eq!(path, blocked),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test(tokio::test)]
    async fn from_source_subscribes_on_creation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let publisher = TopologyPublisher::new();
        let subscribed = FsExporter::from_source(
            &publisher,
            ExportConfig {
                root: dir.path().to_path_buf(),
                ..Default::default()
            },
        );
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(subscribed.exporter().paths().root(), dir.path());

        // published before the loop runs, still delivered
        let topology = NodeTopology {
            gpus: vec![gpu(RESERVATION_NAMESPACE, &[("pod-123", 42)])],
            ..Default::default()
        };
        assert_eq!(publisher.publish(topology).await, 1);
        drop(publisher);

        subscribed.run(CancellationToken::new()).await;

        assert_eq!(read(dir.path(), "pod-123", 0), "42");
    }

    #[test(tokio::test)]
    async fn empty_topology_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = exporter(dir.path())
            .export_snapshot(&NodeTopology::default())
            .await;

        assert_eq!(summary, ExportSummary::default());
        assert!(!dir.path().join("runai").exists());
    }
}
