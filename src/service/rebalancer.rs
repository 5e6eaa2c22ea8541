//! Rebalancer.
//!
//! Drives one in-flight rebalance: polls every retained node's admin surface
//! for vbucket movement progress on a fixed tick, reports progress through the
//! service manager's progress callback, and fires the done callback exactly
//! once on completion, failure or cancel. The coordinator clears its
//! active-rebalancer slot from inside the done callback, which is what allows
//! a subsequent topology change to be admitted.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cluster::{PeerClient, RebalanceProgress};
use crate::error::ServiceError;
use crate::service::ServiceMgr;

/// The interval between progress polls against the retained nodes.
const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// A handle to one in-flight rebalance.
pub(super) struct Rebalancer {
    cancel_tx: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

impl Rebalancer {
    /// Spawn the rebalance driver.
    pub(super) fn spawn(change_id: String, keep_addrs: Vec<String>, peers: Arc<dyn PeerClient>, mgr: Weak<ServiceMgr>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::run(change_id, keep_addrs, peers, mgr, cancel_rx));
        Self { cancel_tx, _handle: handle }
    }

    /// Cancel this rebalance; the done callback will fire with a canceled error.
    pub(super) fn cancel(&self) {
        let _res = self.cancel_tx.send(true);
    }

    async fn run(change_id: String, keep_addrs: Vec<String>, peers: Arc<dyn PeerClient>, mgr: Weak<ServiceMgr>, mut cancel_rx: watch::Receiver<bool>) {
        tracing::info!(id = %change_id, nodes = keep_addrs.len(), "rebalancer initialized");
        let mut tick = tokio::time::interval(PROGRESS_TICK);
        let outcome = loop {
            tokio::select! {
                _ = tick.tick() => {
                    let progress = match Self::poll_progress(&keep_addrs, peers.as_ref()).await {
                        Ok(progress) => progress,
                        Err(err) => {
                            tracing::warn!(error = ?err, id = %change_id, "error polling rebalance progress, will retry");
                            continue;
                        }
                    };
                    if let Some(mgr) = mgr.upgrade() {
                        mgr.rebalance_progress_callback(progress).await;
                    }
                    if progress >= 1.0 {
                        break Ok(());
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break Err(ServiceError::Canceled.into());
                    }
                }
            }
        };
        if let Some(mgr) = mgr.upgrade() {
            mgr.rebalance_done_callback(outcome).await;
        }
        tracing::debug!(id = %change_id, "rebalancer task complete");
    }

    /// Poll all retained nodes & fold their progress into a completion fraction.
    async fn poll_progress(keep_addrs: &[String], peers: &dyn PeerClient) -> Result<f64> {
        let queries = keep_addrs.iter().map(|addr| peers.get_rebalance_progress(addr.clone()));
        let results = futures::future::try_join_all(queries).await?;
        let mut aggregate = RebalanceProgress::default();
        for progress in &results {
            aggregate.merge(progress);
        }
        let total = aggregate.vbs_owned_per_plan + aggregate.vbs_remaining_to_shuffle;
        if aggregate.vbs_remaining_to_shuffle == 0 || total == 0 {
            return Ok(1.0);
        }
        Ok(aggregate.vbs_owned_per_plan as f64 / total as f64)
    }
}
