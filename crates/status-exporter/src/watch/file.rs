use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::fs;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use topology::NodeTopology;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::TopologyPublisher;
use super::TopologyReceiver;
use super::TopologySource;
use super::WatchError;

/// Publishes the node topology stored in a YAML file.
///
/// The file is published once on start, again whenever its directory changes
/// and on every resync tick. Resyncs keep utilization moving because each
/// snapshot is sampled again by the exporter.
pub struct FileTopologyWatcher {
    path: PathBuf,
    resync_interval: Duration,
    publisher: TopologyPublisher,
}

impl FileTopologyWatcher {
    pub fn new<P: Into<PathBuf>>(path: P, resync_interval: Duration) -> Self {
        Self {
            path: path.into(),
            resync_interval,
            publisher: TopologyPublisher::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs until cancelled. Subscribers see the source closed afterwards.
    #[tracing::instrument(skip(self, cancellation_token), fields(path = %self.path.display()))]
    pub async fn run(
        self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<WatchError>> {
        info!("Starting topology file watcher");

        let (fs_tx, mut fs_rx) = mpsc::channel(10);
        // keep the watcher alive for the whole loop
        let _watcher = match self.setup_filesystem_watcher(fs_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Failed to set up filesystem watcher, falling back to polling only: {e:?}");
                None
            }
        };

        let mut resync = interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Topology file watcher shutdown requested");
                    break;
                }
                Some(event) = fs_rx.recv() => {
                    debug!("Filesystem event detected: {:?}", event.kind);
                    self.publish_current(&cancellation_token).await;
                }
                _ = resync.tick() => {
                    debug!("Periodic topology resync");
                    self.publish_current(&cancellation_token).await;
                }
            }
        }

        Ok(())
    }

    async fn publish_current(&self, cancellation_token: &CancellationToken) {
        let topology = match self.read_topology().await {
            Ok(topology) => topology,
            Err(e) => {
                error!("Failed to load node topology: {e:?}");
                return;
            }
        };

        select! {
            _ = cancellation_token.cancelled() => {
                debug!("Cancelled while publishing node topology");
            }
            delivered = self.publisher.publish(topology) => {
                debug!(delivered, "Published node topology");
            }
        }
    }

    async fn read_topology(&self) -> Result<NodeTopology, Report<WatchError>> {
        let content = fs::read_to_string(&self.path)
            .await
            .change_context(WatchError::ReadFailed {
                path: self.path.display().to_string(),
            })?;

        NodeTopology::from_yaml(&content).change_context(WatchError::ParseFailed {
            path: self.path.display().to_string(),
        })
    }

    /// Watches the parent directory since mounted config files are swapped
    /// through symlinks rather than written in place.
    fn setup_filesystem_watcher(
        &self,
        fs_tx: mpsc::Sender<Event>,
    ) -> Result<RecommendedWatcher, Report<WatchError>> {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    // a queued event already triggers a reload
                    let _ = fs_tx.try_send(event);
                }
                Err(e) => {
                    error!("Filesystem watch error: {:?}", e);
                }
            },
            Config::default(),
        )
        .change_context(WatchError::WatcherFailed {
            message: "Failed to create filesystem watcher".to_string(),
        })?;

        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .change_context(WatchError::WatcherFailed {
                message: format!("Failed to watch {}", watch_dir.display()),
            })?;

        Ok(watcher)
    }
}

impl TopologySource for FileTopologyWatcher {
    fn subscribe(&self) -> TopologyReceiver {
        self.publisher.subscribe()
    }
}
