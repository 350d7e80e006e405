//! Topology snapshot delivery.
//!
//! A [`TopologySource`] hands out [`TopologyReceiver`]s. Every receiver gets
//! each published [`NodeTopology`] exactly once, one at a time and in publish
//! order. The channel behind a receiver holds a single snapshot, so a publisher
//! waits while a subscriber is still busy with the previous one.

use core::error::Error;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::sync::mpsc;
use topology::NodeTopology;

pub mod file;

pub use file::FileTopologyWatcher;

/// Something that produces node topology snapshots over time.
pub trait TopologySource {
    /// Register a new subscriber.
    fn subscribe(&self) -> TopologyReceiver;
}

/// Receiving end of a topology subscription
#[derive(Debug)]
pub struct TopologyReceiver {
    receiver: mpsc::Receiver<NodeTopology>,
}

impl TopologyReceiver {
    /// Wait for the next snapshot. `None` once the source is closed.
    pub async fn recv(&mut self) -> Option<NodeTopology> {
        self.receiver.recv().await
    }
}

/// In-memory fan-out of snapshots to every subscriber.
///
/// Clones share the subscriber list. Subscribers see the source as closed once
/// every clone has been dropped or [`TopologyPublisher::close`] was called.
#[derive(Debug, Clone, Default)]
pub struct TopologyPublisher {
    senders: Arc<RwLock<Vec<mpsc::Sender<NodeTopology>>>>,
}

impl TopologyPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `topology` to every live subscriber, returning how many got it.
    pub async fn publish(&self, topology: NodeTopology) -> usize {
        // senders are cloned out so the lock is not held across the sends
        let senders = self.senders.read().expect("poisoned").clone();

        let mut delivered = 0;
        let mut has_closed = false;
        for sender in &senders {
            match sender.send(topology.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => has_closed = true,
            }
        }

        if has_closed {
            self.senders
                .write()
                .expect("poisoned")
                .retain(|sender| !sender.is_closed());
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.read().expect("poisoned").len()
    }

    /// Drop every subscription. Pending snapshots are still delivered.
    pub fn close(&self) {
        self.senders.write().expect("poisoned").clear();
    }
}

impl TopologySource for TopologyPublisher {
    fn subscribe(&self) -> TopologyReceiver {
        let (sender, receiver) = mpsc::channel(1);
        self.senders.write().expect("poisoned").push(sender);
        TopologyReceiver { receiver }
    }
}

/// Errors raised while producing topology snapshots.
#[derive(Debug, derive_more::Display)]
pub enum WatchError {
    #[display("Failed to read topology file {path}")]
    ReadFailed { path: String },
    #[display("Failed to parse topology file {path}")]
    ParseFailed { path: String },
    #[display("Failed to set up filesystem watcher: {message}")]
    WatcherFailed { message: String },
}

impl Error for WatchError {}
