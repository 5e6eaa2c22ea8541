//! Cluster change watcher.
//!
//! A transient per-producer task subscribed to the cluster manager's topology
//! notifications. The subscription is one-shot-consuming, so the watcher is a
//! two-state machine: `Watching` until a change is observed (or the subscription
//! dies), then `Restarting` for a fixed interval before re-subscribing. There is
//! no terminal state while the owning producer is alive; the producer's stop
//! signal kills the watcher externally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cluster::ClusterManager;

/// The interval slept between a watcher restart and its re-subscribe.
pub const WATCH_CLUSTER_CHANGE_INTERVAL: Duration = Duration::from_millis(100);

/// The watcher's state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// Subscribed, waiting on notifications.
    Watching,
    /// Transient, sleeping before re-subscribe.
    Restarting,
}

/// A watcher of cluster topology changes, owned by one producer.
pub struct ClusterChangeWatcher {
    app_name: String,
    cluster: Arc<dyn ClusterManager>,
    /// The producer-side change signal; capacity >= 1 so an un-consumed
    /// notification is never lost, while the watcher never blocks on a slow
    /// producer. A pending notification already covers any further change.
    notify_tx: mpsc::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    state: WatcherState,
}

impl ClusterChangeWatcher {
    /// Create a new instance.
    pub fn new(app_name: String, cluster: Arc<dyn ClusterManager>, notify_tx: mpsc::Sender<bool>, stop_rx: watch::Receiver<bool>) -> Self {
        Self {
            app_name,
            cluster,
            notify_tx,
            stop_rx,
            state: WatcherState::Watching,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(app = %self.app_name, "cluster change watcher initialized");
        loop {
            if *self.stop_rx.borrow() {
                return Ok(());
            }
            match self.state {
                WatcherState::Watching => self.watch_once().await,
                WatcherState::Restarting => {
                    tokio::select! {
                        _ = tokio::time::sleep(WATCH_CLUSTER_CHANGE_INTERVAL) => self.state = WatcherState::Watching,
                        _ = self.stop_rx.changed() => (),
                    }
                }
            }
        }
    }

    /// Run one subscribe/observe cycle, always ending in `Restarting`.
    async fn watch_once(&mut self) {
        let mut notifications = match self.cluster.subscribe().await {
            Ok(rx) => rx,
            Err(err) => {
                tracing::error!(error = ?err, app = %self.app_name, "error subscribing to cluster change notifications");
                self.state = WatcherState::Restarting;
                return;
            }
        };
        tokio::select! {
            event = notifications.recv() => {
                if event.is_some() {
                    tracing::info!(app = %self.app_name, "observed change in cluster state");
                    // A full channel means an un-consumed notification is already
                    // pending for the producer, which covers this change as well.
                    let _res = self.notify_tx.try_send(true);
                }
                self.state = WatcherState::Restarting;
            }
            _ = self.stop_rx.changed() => (),
        }
    }
}
