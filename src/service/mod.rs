//! Topology-change / rebalance state machine.
//!
//! Implements the cluster orchestrator's service-manager callback contract:
//! prepare, start, monitor & cancel for topology changes, guarded by
//! revision-based optimistic concurrency. A single coordinator-wide mutex
//! protects the revision-tagged state; blocking reads (`get_task_list`,
//! `get_current_topology`) wait on the revision watch channel and select
//! against the caller's cancel signal. Precondition violations surface as the
//! orchestrator's error vocabulary (`NotFound` / `NotSupported` / `Conflict`)
//! and are never retried.

#[cfg(test)]
mod mod_test;
mod rebalancer;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch, Mutex};

use crate::cluster::{get_agg_bootstrapping_apps, ClusterManager, PeerClient};
use crate::config::Config;
use crate::error::{as_service_error, ServiceError};
use crate::metakv::{MetadataStore, METAKV_KEEP_NODES_PATH};
use crate::service::rebalancer::Rebalancer;
use crate::supersup::SuperSupervisor;
use crate::utils::{decode_rev, encode_rev, retry, FixedBackoff};

/// The backoff applied when persisting the retained-node set.
const KEEP_NODES_STORE_BACKOFF: FixedBackoff = FixedBackoff::new(Duration::from_secs(1));
/// The bound on attempts when persisting the retained-node set.
const KEEP_NODES_STORE_RETRIES: usize = 5;

/// An opaque revision: monotonic, comparable only for equality by callers.
pub type Revision = Vec<u8>;

/// Info identifying this node to the cluster orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub priority: i64,
    pub opaque: serde_json::Value,
}

/// A node referenced by a topology change request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_id: String,
}

/// The type of a requested topology change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyChangeType {
    #[serde(rename = "topology-change-rebalance")]
    Rebalance,
    #[serde(rename = "topology-change-failover")]
    Failover,
    #[serde(other)]
    Unknown,
}

/// A topology change request issued by the cluster orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyChange {
    pub id: String,
    #[serde(default)]
    pub current_topology_rev: Option<Revision>,
    #[serde(rename = "type")]
    pub change_type: TopologyChangeType,
    #[serde(default)]
    pub keep_nodes: Vec<NodeRef>,
    #[serde(default)]
    pub eject_nodes: Vec<NodeRef>,
}

/// The type of a task surfaced to the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "task-prepared")]
    Prepared,
    #[serde(rename = "task-rebalance")]
    Rebalance,
    #[serde(rename = "task-failover")]
    Failover,
}

/// The status of a task surfaced to the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "task-running")]
    Running,
}

/// One task surfaced to the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub rev: Revision,
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub is_cancelable: bool,
    pub progress: f64,
}

/// The task list surfaced to the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub rev: Revision,
    pub tasks: Vec<Task>,
}

/// The current topology surfaced to the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub rev: Revision,
    pub nodes: Vec<String>,
    pub is_balanced: bool,
    pub messages: Vec<String>,
}

struct ServiceState {
    rev: u64,
    rebalance_id: Option<String>,
    keep_node_uuids: Vec<String>,
    rebalance_change: Option<TopologyChange>,
    rebalance_progress: f64,
    failover_notif: bool,
    rebalancer: Option<Rebalancer>,
}

/// The service manager registered against the cluster orchestrator.
pub struct ServiceMgr {
    config: Arc<Config>,
    super_sup: SuperSupervisor,
    metakv: Arc<dyn MetadataStore>,
    cluster: Arc<dyn ClusterManager>,
    peers: Arc<dyn PeerClient>,

    state: Mutex<ServiceState>,
    /// The revision signal observed by blocked `get_task_list` / `get_current_topology` calls.
    rev_tx: watch::Sender<u64>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl ServiceMgr {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, super_sup: SuperSupervisor, metakv: Arc<dyn MetadataStore>, cluster: Arc<dyn ClusterManager>, peers: Arc<dyn PeerClient>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let (rev_tx, _rev_rx) = watch::channel(0);
        Arc::new(Self {
            config,
            super_sup,
            metakv,
            cluster,
            peers,
            state: Mutex::new(ServiceState {
                rev: 0,
                rebalance_id: None,
                keep_node_uuids: Vec::new(),
                rebalance_change: None,
                rebalance_progress: 0.0,
                failover_notif: false,
                rebalancer: None,
            }),
            rev_tx,
            shutdown_tx,
        })
    }

    /// Info identifying this node to the orchestrator.
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.config.node_uuid.clone(),
            priority: 0,
            opaque: serde_json::json!({ "admin_port": self.config.admin_port }),
        }
    }

    /// Begin graceful shutdown of this node's eventing service.
    pub fn shutdown(&self) {
        tracing::info!("service manager shutdown requested");
        let _res = self.shutdown_tx.send(());
    }

    /// Block until the current revision differs from the caller's last-seen
    /// revision, or the caller cancels the wait.
    async fn wait(&self, known_rev: Option<&Revision>, cancel: &mut oneshot::Receiver<()>) -> Result<()> {
        let known = match known_rev {
            None => return Ok(()),
            Some(rev) => decode_rev(rev).context("error decoding caller revision")?,
        };
        let mut rev_rx = self.rev_tx.subscribe();
        loop {
            if *rev_rx.borrow() != known {
                return Ok(());
            }
            tokio::select! {
                res = rev_rx.changed() => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
                _ = &mut *cancel => return Err(ServiceError::Canceled.into()),
            }
        }
    }

    /// Get the current task list, blocking while it is unchanged from `rev`.
    pub async fn get_task_list(&self, rev: Option<Revision>, mut cancel: oneshot::Receiver<()>) -> Result<TaskList> {
        tracing::debug!(rev = ?rev, "get task list");
        self.wait(rev.as_ref(), &mut cancel).await?;
        let state = self.state.lock().await;
        Ok(Self::state_to_task_list(&state))
    }

    /// Get the current topology, blocking while it is unchanged from `rev`.
    pub async fn get_current_topology(&self, rev: Option<Revision>, mut cancel: oneshot::Receiver<()>) -> Result<Topology> {
        tracing::debug!(rev = ?rev, "get current topology");
        self.wait(rev.as_ref(), &mut cancel).await?;
        let state = self.state.lock().await;
        let nodes = if state.keep_node_uuids.is_empty() {
            vec![self.config.node_uuid.clone()]
        } else {
            state.keep_node_uuids.clone()
        };
        Ok(Topology {
            rev: encode_rev(state.rev),
            nodes,
            is_balanced: state.rebalance_change.is_none(),
            messages: Vec::new(),
        })
    }

    fn state_to_task_list(state: &ServiceState) -> TaskList {
        let rev = encode_rev(state.rev);
        let mut tasks = Vec::new();
        if state.failover_notif {
            tasks.push(Task {
                rev: rev.clone(),
                id: "failover-recovery".into(),
                task_type: TaskType::Failover,
                status: TaskStatus::Running,
                is_cancelable: false,
                progress: 0.0,
            });
        }
        if let Some(change) = &state.rebalance_change {
            tasks.push(Task {
                rev: rev.clone(),
                id: change.id.clone(),
                task_type: TaskType::Rebalance,
                status: TaskStatus::Running,
                is_cancelable: true,
                progress: state.rebalance_progress,
            });
        } else if let Some(rebalance_id) = &state.rebalance_id {
            tasks.push(Task {
                rev: rev.clone(),
                id: rebalance_id.clone(),
                task_type: TaskType::Prepared,
                status: TaskStatus::Running,
                is_cancelable: true,
                progress: 0.0,
            });
        }
        TaskList { rev, tasks }
    }

    /// Cancel the identified task.
    pub async fn cancel_task(&self, id: &str, rev: Option<Revision>) -> Result<()> {
        let mut state = self.state.lock().await;
        tracing::info!(%id, rev = ?rev, "cancel task");

        let tasks = Self::state_to_task_list(&state).tasks;
        let task = match tasks.iter().find(|task| task.id == id) {
            Some(task) => task,
            None => return Err(ServiceError::NotFound.into()),
        };
        if !task.is_cancelable {
            return Err(ServiceError::NotSupported.into());
        }
        if let Some(rev) = rev {
            if rev != task.rev {
                return Err(ServiceError::Conflict.into());
            }
        }

        match task.task_type {
            TaskType::Prepared => {
                state.rebalance_id = None;
                state.keep_node_uuids.clear();
                self.bump_rev_locked(&mut state);
            }
            TaskType::Rebalance => {
                if let Some(rebalancer) = &state.rebalancer {
                    rebalancer.cancel();
                }
            }
            TaskType::Failover => unreachable!("failover tasks are not cancelable"),
        }
        Ok(())
    }

    /// Record the incoming topology change & pre-stage the retained-node set.
    ///
    /// Always accepted; a repeated prepare is an idempotent overwrite.
    pub async fn prepare_topology_change(&self, change: TopologyChange) -> Result<()> {
        let keep_node_uuids: Vec<String> = change.keep_nodes.iter().map(|node| node.node_id.clone()).collect();
        {
            let mut state = self.state.lock().await;
            tracing::info!(id = %change.id, keep_nodes = ?keep_node_uuids, "prepare topology change");
            state.keep_node_uuids = keep_node_uuids.clone();
            state.rebalance_id = Some(change.id.clone());
            self.bump_rev_locked(&mut state);
        }
        self.super_sup.notify_prepare_topology_change(&keep_node_uuids);
        Ok(())
    }

    /// Start the prepared topology change.
    pub async fn start_topology_change(self: &Arc<Self>, change: TopologyChange) -> Result<()> {
        let mut state = self.state.lock().await;
        tracing::info!(id = %change.id, change_type = ?change.change_type, "start topology change");

        if state.rebalance_id.as_deref() != Some(change.id.as_str()) || state.rebalancer.is_some() {
            tracing::error!(
                rebalance_id = ?state.rebalance_id, change_id = %change.id, rebalancer_active = state.rebalancer.is_some(),
                "returning conflict for topology change",
            );
            return Err(ServiceError::Conflict.into());
        }
        if let Some(have_rev) = &change.current_topology_rev {
            let have = decode_rev(have_rev).context("error decoding topology revision")?;
            if have != state.rev {
                tracing::error!(state_rev = state.rev, have_rev = have, "returning conflict for stale topology revision");
                return Err(ServiceError::Conflict.into());
            }
        }

        match change.change_type {
            TopologyChangeType::Failover => {
                self.store_keep_nodes(&state.keep_node_uuids).await?;
                state.failover_notif = true;
                self.bump_rev_locked(&mut state);
            }
            TopologyChangeType::Rebalance => {
                let members = self.cluster.eventing_members().await.context("error fetching active eventing nodes")?;
                let node_addrs: Vec<String> = members.iter().map(|member| member.addr.clone()).collect();
                if !node_addrs.is_empty() {
                    tracing::info!(nodes = ?node_addrs, "querying nodes for bootstrap status");
                    // Fail rebalance if some apps are undergoing bootstrap.
                    get_agg_bootstrapping_apps(self.peers.as_ref(), &node_addrs).await?;
                }
                self.store_keep_nodes(&state.keep_node_uuids).await?;

                tracing::info!("starting up rebalancer");
                let keep_addrs: Vec<String> = members
                    .iter()
                    .filter(|member| state.keep_node_uuids.contains(&member.uuid))
                    .map(|member| member.addr.clone())
                    .collect();
                let rebalancer = Rebalancer::spawn(change.id.clone(), keep_addrs, self.peers.clone(), Arc::downgrade(self));
                state.rebalance_change = Some(change);
                state.rebalance_progress = 0.0;
                state.rebalancer = Some(rebalancer);
                self.bump_rev_locked(&mut state);
            }
            TopologyChangeType::Unknown => return Err(ServiceError::NotSupported.into()),
        }
        Ok(())
    }

    /// Persist the retained-node set, retrying with the standard fixed backoff.
    async fn store_keep_nodes(&self, keep_node_uuids: &[String]) -> Result<()> {
        let value = serde_json::to_vec(keep_node_uuids).context("error encoding retained-node set")?;
        retry(KEEP_NODES_STORE_BACKOFF, KEEP_NODES_STORE_RETRIES, || {
            self.metakv.set(METAKV_KEEP_NODES_PATH.into(), value.clone())
        })
        .await
        .context("error persisting retained-node set")
    }

    /// Record rebalance progress reported by the rebalancer.
    pub(super) async fn rebalance_progress_callback(&self, progress: f64) {
        let mut state = self.state.lock().await;
        if state.rebalance_change.is_some() && (state.rebalance_progress - progress).abs() > f64::EPSILON {
            state.rebalance_progress = progress;
            self.bump_rev_locked(&mut state);
        }
    }

    /// Record rebalance completion & clear the active-rebalancer slot.
    ///
    /// Invoked exactly once per rebalancer, after which a subsequent
    /// `start_topology_change` may proceed.
    pub(super) async fn rebalance_done_callback(&self, res: Result<()>) {
        let mut state = self.state.lock().await;
        match &res {
            Ok(_) => tracing::info!("rebalance completed"),
            Err(err) if as_service_error(err) == Some(ServiceError::Canceled) => tracing::warn!("rebalance canceled"),
            Err(err) => tracing::error!(error = ?err, "rebalance failed"),
        }
        state.rebalancer = None;
        state.rebalance_change = None;
        state.rebalance_id = None;
        state.rebalance_progress = 0.0;
        self.bump_rev_locked(&mut state);
    }

    fn bump_rev_locked(&self, state: &mut ServiceState) {
        state.rev += 1;
        let _res = self.rev_tx.send(state.rev);
    }
}
