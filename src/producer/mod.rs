//! Producer controller.
//!
//! A producer owns one deployed application's runtime: the vbucket to node
//! assignment derived from the live cluster membership, the set of worker
//! execution units bound to this node's share of the vbuckets, and the cluster
//! change watcher which triggers re-partitioning. Producers are supervised as
//! one service each in the supervisor tree, so the full startup path here is
//! idempotent across restarts.
//!
//! ## Partition assignment
//! Assignment is purely deterministic: the live member list is sorted by node
//! UUID and vbucket `i` is assigned to member `i mod N`. Any two nodes observing
//! the same member list derive the same assignment, which is the correctness
//! requirement; no coordination happens on this path. This node's share is then
//! split into contiguous chunks across the configured worker count.

#[cfg(test)]
mod mod_test;
pub mod watcher;
mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::cluster::{ClusterManager, Member, RebalanceProgress};
use crate::config::{Config, StreamBoundary};
use crate::error::ERR_NO_EVENTING_NODES;
use crate::producer::watcher::ClusterChangeWatcher;
use crate::producer::worker::{Worker, WorkerHandle};
use crate::suptree::Service;
use crate::utils::{retry, FixedBackoff};

/// The fixed number of logical partitions (vbuckets) of the data source's keyspace.
pub const NUM_VBUCKETS: u16 = 1024;

/// The backoff applied when retrying a failed worker spawn.
const WORKER_SPAWN_BACKOFF: FixedBackoff = FixedBackoff::new(Duration::from_secs(1));
/// The bound on worker spawn attempts for a single shard.
const WORKER_SPAWN_RETRIES: usize = 5;
/// The backoff applied when retrying cluster membership queries.
const MEMBERS_QUERY_BACKOFF: FixedBackoff = FixedBackoff::new(Duration::from_secs(1));
/// The bound on cluster membership query attempts.
const MEMBERS_QUERY_RETRIES: usize = 5;

/// Per-application settings adjustable at runtime through the status RPC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Whether event processing is paused.
    pub pause: bool,
    /// The number of workers owning this node's vbucket share.
    pub worker_count: usize,
    /// The deadline applied to handler execution, in seconds.
    pub deadline_timeout: u64,
    /// Whether doc timers are cleaned up on undeploy.
    pub cleanup_timers: bool,
}

/// A partial settings update, restricted to the allowed option set.
///
/// Unknown fields reject the whole update, so application is all-or-nothing.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    pub pause: Option<bool>,
    pub worker_count: Option<usize>,
    pub deadline_timeout: Option<u64>,
    pub cleanup_timers: Option<bool>,
}

/// Per-vbucket processing stats surfaced over the status RPC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbStat {
    /// The last processed sequence number.
    pub seq: u64,
    /// The worker currently owning the vbucket.
    pub worker: String,
}

struct ProducerState {
    settings: AppSettings,
    vb_node_assignment: HashMap<u16, String>,
    worker_vb_map: HashMap<String, Vec<u16>>,
    workers: HashMap<String, WorkerHandle>,
    keep_nodes: Option<Vec<String>>,
    bootstrapped: bool,
    draining: bool,
}

struct ServeChannels {
    change_rx: mpsc::Receiver<bool>,
    init_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

/// A controller owning one deployed application's runtime.
pub struct Producer {
    app_name: String,
    config: Arc<Config>,
    cluster: Arc<dyn ClusterManager>,
    boundary: StreamBoundary,
    state: RwLock<ProducerState>,

    /// The change signal written by the cluster change watcher.
    cluster_change_tx: mpsc::Sender<bool>,
    /// The channel over which a successor announces a replace-in-place.
    init_tx: mpsc::Sender<oneshot::Sender<()>>,
    /// The channel acknowledging clean shutdown to the owner, capacity 1.
    supervisor_ack_tx: mpsc::Sender<()>,
    /// The stop signal observed by the run loop, the watcher and all workers.
    stop_tx: watch::Sender<bool>,
    /// Receivers owned by the run loop; taken at serve start, restored on exit
    /// so that a supervised restart re-runs the full startup path.
    channels: Mutex<Option<ServeChannels>>,
}

impl Producer {
    /// Create a new instance, returning the shutdown-acknowledgment receiver
    /// alongside, which the owner holds for the replace-in-place protocol.
    pub fn new(app_name: String, config: Arc<Config>, cluster: Arc<dyn ClusterManager>) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (cluster_change_tx, change_rx) = mpsc::channel(1);
        let (init_tx, init_rx) = mpsc::channel(1);
        let (supervisor_ack_tx, supervisor_ack_rx) = mpsc::channel(1);
        let (stop_tx, _stop_rx) = watch::channel(false);
        let settings = AppSettings {
            pause: false,
            worker_count: config.worker_count,
            deadline_timeout: config.deadline_timeout,
            cleanup_timers: false,
        };
        let producer = Arc::new(Self {
            app_name,
            boundary: config.stream_boundary,
            config,
            cluster,
            state: RwLock::new(ProducerState {
                settings,
                vb_node_assignment: HashMap::new(),
                worker_vb_map: HashMap::new(),
                workers: HashMap::new(),
                keep_nodes: None,
                bootstrapped: false,
                draining: false,
            }),
            cluster_change_tx,
            init_tx,
            supervisor_ack_tx,
            stop_tx,
            channels: Mutex::new(Some(ServeChannels { change_rx, init_rx })),
        });
        (producer, supervisor_ack_rx)
    }

    /// The name of the application this producer runs.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Tell this instance that a successor is about to take over, blocking until
    /// it has released its vbucket ownership.
    pub async fn notify_init(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.init_tx.send(ack_tx).await.is_ok() {
            let _res = ack_rx.await;
        }
    }

    /// Pre-stage the retained-node set of an incoming topology change, consumed
    /// by the next re-partitioning pass.
    pub fn notify_prepare_topology_change(&self, keep_nodes: Vec<String>) {
        let mut state = self.state.write().expect("producer state lock poisoned");
        state.keep_nodes = Some(keep_nodes);
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let _res = self.stop_tx.send_replace(false);
        let mut channels = self
            .channels
            .lock()
            .expect("producer channels lock poisoned")
            .take()
            .context("producer serve channels already taken")?;

        let watcher = ClusterChangeWatcher::new(
            self.app_name.clone(),
            self.cluster.clone(),
            self.cluster_change_tx.clone(),
            self.stop_tx.subscribe(),
        )
        .spawn();

        let result = self.serve_inner(&mut channels).await;

        // Stop was either requested externally or forced below so the watcher
        // and workers wind down on error exits as well.
        let stop_requested = *self.stop_tx.subscribe().borrow();
        let _res = self.stop_tx.send(true);
        self.teardown_workers().await;
        if let Err(err) = watcher.await.context("error joining cluster change watcher").and_then(|res| res) {
            tracing::error!(error = ?err, app = %self.app_name, "error shutting down cluster change watcher");
        }
        self.channels.lock().expect("producer channels lock poisoned").replace(channels);
        if stop_requested {
            let _res = self.supervisor_ack_tx.try_send(());
        }
        tracing::info!(app = %self.app_name, "producer shutdown complete");
        result
    }

    async fn serve_inner(&self, channels: &mut ServeChannels) -> Result<()> {
        self.repartition().await.context("error deriving initial partition assignment")?;
        {
            let mut state = self.state.write().expect("producer state lock poisoned");
            state.bootstrapped = true;
        }
        tracing::info!(app = %self.app_name, "producer bootstrapped");

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                Some(_change) = channels.change_rx.recv() => {
                    self.repartition().await.context("error re-partitioning after cluster change")?;
                }
                Some(ack) = channels.init_rx.recv() => {
                    tracing::info!(app = %self.app_name, "successor incoming, releasing vbucket ownership");
                    {
                        let mut state = self.state.write().expect("producer state lock poisoned");
                        state.draining = true;
                    }
                    self.teardown_workers().await;
                    let _res = ack.send(());
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Derive vbucket ownership from the current cluster membership and
    /// re-shard this node's slice across workers.
    ///
    /// Notifications are idempotent triggers: assignment is always derived from
    /// the membership observed now, so the last observed state wins when
    /// changes arrive back to back.
    async fn repartition(&self) -> Result<()> {
        let mut members = retry(MEMBERS_QUERY_BACKOFF, MEMBERS_QUERY_RETRIES, || self.cluster.eventing_members())
            .await
            .context("error fetching eventing members from cluster manager")?;
        let keep_nodes = {
            let state = self.state.read().expect("producer state lock poisoned");
            if state.draining {
                return Ok(());
            }
            state.keep_nodes.clone()
        };
        if let Some(keep) = &keep_nodes {
            members.retain(|member| keep.contains(&member.uuid));
        }
        if members.is_empty() {
            bail!(ERR_NO_EVENTING_NODES);
        }

        let assignment = vbucket_node_assignment(&members);
        let mut owned: Vec<u16> = assignment.iter().filter(|(_, uuid)| uuid.as_str() == self.config.node_uuid).map(|(vb, _)| *vb).collect();
        owned.sort_unstable();

        // Assignment recomputation & worker bookkeeping happen under the write
        // lock; stopping and spawning workers happen outside it.
        let (plan, old_workers, paused) = {
            let mut state = self.state.write().expect("producer state lock poisoned");
            let plan = worker_vbucket_map(&self.app_name, &owned, state.settings.worker_count);
            state.vb_node_assignment = assignment;
            state.worker_vb_map = plan.clone();
            let old_workers: Vec<WorkerHandle> = state.workers.drain().map(|(_, handle)| handle).collect();
            (plan, old_workers, state.settings.pause)
        };
        for handle in old_workers {
            handle.stop().await;
        }
        if !paused {
            self.spawn_workers(plan).await?;
        }
        tracing::info!(app = %self.app_name, nodes = members.len(), owned = owned.len(), "partition assignment derived");
        Ok(())
    }

    /// Spawn one worker per shard of the given plan.
    ///
    /// A failed spawn retries only that shard with the standard fixed backoff.
    async fn spawn_workers(&self, plan: HashMap<String, Vec<u16>>) -> Result<()> {
        for (name, vbuckets) in plan {
            let handle = retry(WORKER_SPAWN_BACKOFF, WORKER_SPAWN_RETRIES, || {
                Worker::spawn(name.clone(), self.app_name.clone(), vbuckets.clone(), self.boundary)
            })
            .await
            .with_context(|| format!("error spawning worker {}", name))?;
            tracing::debug!(app = %self.app_name, worker = %handle.name, addr = %handle.addr, vbuckets = handle.vbuckets.len(), "worker spawned");
            let mut state = self.state.write().expect("producer state lock poisoned");
            state.workers.insert(handle.name.clone(), handle);
        }
        Ok(())
    }

    /// Stop all running workers, retaining assignment state.
    async fn teardown_workers(&self) {
        let workers: Vec<WorkerHandle> = {
            let mut state = self.state.write().expect("producer state lock poisoned");
            state.workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in workers {
            handle.stop().await;
        }
    }

    /// The current vbucket to node assignment.
    pub fn assignment_map(&self) -> HashMap<u16, String> {
        self.state.read().expect("producer state lock poisoned").vb_node_assignment.clone()
    }

    /// The current worker to vbucket assignment.
    pub fn worker_map(&self) -> HashMap<String, Vec<u16>> {
        self.state.read().expect("producer state lock poisoned").worker_vb_map.clone()
    }

    /// The current settings.
    pub fn settings(&self) -> AppSettings {
        self.state.read().expect("producer state lock poisoned").settings.clone()
    }

    /// Whether this producer has completed its initial partition assignment.
    pub fn is_bootstrapped(&self) -> bool {
        self.state.read().expect("producer state lock poisoned").bootstrapped
    }

    /// The number of currently live workers.
    pub fn active_worker_count(&self) -> usize {
        self.state.read().expect("producer state lock poisoned").workers.len()
    }

    /// The number of events received but not yet processed, across all workers.
    pub fn remaining_events(&self) -> u64 {
        let state = self.state.read().expect("producer state lock poisoned");
        state.workers.values().map(|handle| handle.stats().queued()).sum()
    }

    /// Per-vbucket processing stats for this node's owned vbuckets.
    pub fn vb_stats(&self) -> HashMap<u16, VbStat> {
        let state = self.state.read().expect("producer state lock poisoned");
        let mut stats = HashMap::new();
        for handle in state.workers.values() {
            for (vb, seq) in handle.stats().vb_seqs() {
                stats.insert(vb, VbStat { seq, worker: handle.name.clone() });
            }
        }
        stats
    }

    /// Whether a re-partitioning toward a staged retained-node set is still pending.
    pub fn rebalance_status(&self) -> bool {
        let state = self.state.read().expect("producer state lock poisoned");
        match &state.keep_nodes {
            Some(keep) => state.vb_node_assignment.values().any(|uuid| !keep.contains(uuid)),
            None => false,
        }
    }

    /// This node's view of rebalance progress toward the staged retained-node set.
    pub fn rebalance_progress(&self) -> RebalanceProgress {
        let state = self.state.read().expect("producer state lock poisoned");
        let owned = state.vb_node_assignment.values().filter(|uuid| uuid.as_str() == self.config.node_uuid).count() as u64;
        let remaining = match &state.keep_nodes {
            Some(keep) => state.vb_node_assignment.values().filter(|uuid| !keep.contains(*uuid)).count() as u64,
            None => 0,
        };
        RebalanceProgress {
            vbs_remaining_to_shuffle: remaining,
            vbs_owned_per_plan: owned,
        }
    }

    /// Validate & apply a settings update atomically.
    ///
    /// Pausing stops workers without releasing assignment state, so resuming
    /// does not require re-derivation.
    pub async fn update_settings(&self, payload: serde_json::Value) -> Result<()> {
        let update: SettingsUpdate = serde_json::from_value(payload).map_err(|err| anyhow!("invalid settings payload: {}", err))?;
        if update.worker_count == Some(0) {
            bail!("invalid settings payload: worker_count must be >= 1");
        }

        let (plan, old_workers, respawn) = {
            let mut state = self.state.write().expect("producer state lock poisoned");
            let previous = state.settings.clone();
            let mut next = previous.clone();
            if let Some(pause) = update.pause {
                next.pause = pause;
            }
            if let Some(worker_count) = update.worker_count {
                next.worker_count = worker_count;
            }
            if let Some(deadline_timeout) = update.deadline_timeout {
                next.deadline_timeout = deadline_timeout;
            }
            if let Some(cleanup_timers) = update.cleanup_timers {
                next.cleanup_timers = cleanup_timers;
            }
            if next == previous {
                return Ok(());
            }
            state.settings = next.clone();

            let reshard = !next.pause && (previous.pause || next.worker_count != previous.worker_count);
            let plan = if reshard {
                let mut owned: Vec<u16> = state.worker_vb_map.values().flatten().copied().collect();
                owned.sort_unstable();
                let plan = worker_vbucket_map(&self.app_name, &owned, next.worker_count);
                state.worker_vb_map = plan.clone();
                Some(plan)
            } else {
                None
            };
            let teardown = next.pause && !previous.pause || plan.is_some();
            let old_workers: Vec<WorkerHandle> = if teardown {
                state.workers.drain().map(|(_, handle)| handle).collect()
            } else {
                Vec::new()
            };
            (plan, old_workers, reshard)
        };

        for handle in old_workers {
            handle.stop().await;
        }
        if respawn {
            if let Some(plan) = plan {
                self.spawn_workers(plan).await?;
            }
        }
        tracing::info!(app = %self.app_name, "settings updated");
        Ok(())
    }
}

impl Service for Producer {
    fn name(&self) -> &str {
        &self.app_name
    }

    fn serve(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(self.run())
    }

    fn shutdown(&self) {
        let _res = self.stop_tx.send(true);
    }
}

/// Deterministically assign all vbuckets across the given members.
///
/// Members are ordered by UUID and vbucket `i` goes to member `i mod N`, so any
/// node observing the same member list derives the same assignment.
pub fn vbucket_node_assignment(members: &[Member]) -> HashMap<u16, String> {
    let mut uuids: Vec<&String> = members.iter().map(|member| &member.uuid).collect();
    uuids.sort_unstable();
    uuids.dedup();
    let mut assignment = HashMap::with_capacity(NUM_VBUCKETS as usize);
    if uuids.is_empty() {
        return assignment;
    }
    for vb in 0..NUM_VBUCKETS {
        assignment.insert(vb, uuids[vb as usize % uuids.len()].clone());
    }
    assignment
}

/// Split this node's owned vbuckets into contiguous chunks, one per worker.
pub fn worker_vbucket_map(app_name: &str, vbuckets: &[u16], worker_count: usize) -> HashMap<String, Vec<u16>> {
    let mut map = HashMap::new();
    if vbuckets.is_empty() || worker_count == 0 {
        return map;
    }
    let workers = worker_count.min(vbuckets.len());
    let chunk_size = (vbuckets.len() + workers - 1) / workers;
    for (idx, chunk) in vbuckets.chunks(chunk_size).enumerate() {
        map.insert(format!("worker_{}_{}", app_name, idx), chunk.to_vec());
    }
    map
}
