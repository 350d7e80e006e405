use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Cli;
use crate::export::FsExporter;
use crate::watch::FileTopologyWatcher;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Wires the topology watcher to the filesystem exporter
pub struct Application {
    cli: Cli,
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Application {
    pub fn new(cli: Cli) -> Self {
        Self {
            cli,
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Token cancelling every task of this application
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Start all tasks and wait until a shutdown signal arrives or a task ends
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("Starting all application tasks...");
        self.spawn_all_tasks();
        self.wait_for_completion().await?;
        tracing::info!("Application run completed");
        Ok(())
    }

    fn spawn_all_tasks(&mut self) {
        let watcher =
            FileTopologyWatcher::new(&self.cli.topology_file, self.cli.resync_interval());
        // subscribe before the watcher starts so the first snapshot is not lost
        let exporter = FsExporter::from_source(&watcher, self.cli.export_config());

        let exporter_task = {
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting filesystem exporter task");
                exporter.run(token).await;
                tracing::info!("Filesystem exporter task completed");
            })
        };
        self.tasks.push(exporter_task);

        let watcher_task = {
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting topology watcher task");
                if let Err(e) = watcher.run(token).await {
                    tracing::error!("Topology watcher failed: {e:?}");
                } else {
                    tracing::info!("Topology watcher task completed");
                }
            })
        };
        self.tasks.push(watcher_task);
    }

    async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        let token = self.cancellation_token.clone();
        let finished = tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                None
            }
            _ = token.cancelled() => {
                tracing::info!("Application cancelled");
                None
            }
            (result, index, _) = futures::future::select_all(self.tasks.iter_mut()) => {
                Some((result, index))
            }
        };

        let mut failure = None;
        if let Some((result, index)) = finished {
            // a finished handle must not be awaited again
            self.tasks.remove(index);
            match result {
                Ok(()) => tracing::warn!("Task completed unexpectedly"),
                Err(e) => {
                    tracing::error!("Task completed with error: {e}");
                    failure = Some(e);
                }
            }
        }

        self.shutdown().await;
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        self.cancellation_token.cancel();

        tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        });
    }
}
