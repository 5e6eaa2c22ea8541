//! Cluster manager collaborator boundary.
//!
//! Covers the two surfaces the core needs from the cluster manager: topology
//! change notifications and membership snapshots, plus the outbound peer-query
//! client used for bootstrap checks and rebalance progress polling.
//!
//! Change subscriptions are one-shot-consuming: the returned channel delivers
//! at most one notification and is then closed, so observers re-subscribe after
//! every observed change. The `ClusterChangeWatcher` in the producer module is
//! built around exactly this contract.

#[cfg(test)]
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The fixed request timeout for outbound status/progress queries to peer nodes.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// A single node of the cluster as reported by the cluster manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The node's UUID.
    pub uuid: String,
    /// The node's admin address, `host:port`.
    pub addr: String,
}

/// The surface of the external cluster manager consumed by this crate.
pub trait ClusterManager: Send + Sync + 'static {
    /// Subscribe to topology change notifications.
    ///
    /// The returned channel yields at most one notification and is closed after
    /// delivery; callers re-subscribe to observe further changes.
    fn subscribe(&self) -> BoxFuture<'_, Result<mpsc::Receiver<()>>>;

    /// Snapshot of the live eventing-service members.
    fn eventing_members(&self) -> BoxFuture<'_, Result<Vec<Member>>>;

    /// Snapshot of the live data-service members.
    fn data_members(&self) -> BoxFuture<'_, Result<Vec<Member>>>;
}

/// An in-memory cluster manager used by the binary's local mode and by tests.
pub struct MemoryCluster {
    members: RwLock<Vec<Member>>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
    fail_subscribes: Mutex<usize>,
}

impl MemoryCluster {
    /// Create a new instance with the given seed membership.
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            members: RwLock::new(members),
            subscribers: Mutex::new(Vec::new()),
            fail_subscribes: Mutex::new(0),
        }
    }

    /// Create a new instance from a `uuid@host:port` comma-separated member list.
    pub fn from_member_list(list: &str) -> Result<Self> {
        let mut members = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (uuid, addr) = entry.split_once('@').context("invalid cluster member entry, expected uuid@host:port")?;
            members.push(Member { uuid: uuid.into(), addr: addr.into() });
        }
        Ok(Self::new(members))
    }

    /// Replace the membership and notify all subscribers of the change.
    ///
    /// Subscriber channels are closed after delivery, matching the
    /// one-shot-consuming contract of `ClusterManager::subscribe`.
    pub fn set_members(&self, members: Vec<Member>) {
        *self.members.write().expect("cluster members lock poisoned") = members;
        let subscribers = std::mem::take(&mut *self.subscribers.lock().expect("cluster subscribers lock poisoned"));
        for sub in subscribers {
            let _res = sub.try_send(());
        }
    }

    /// Close all subscriber channels without an observed change.
    #[cfg(test)]
    pub fn drop_subscribers(&self) {
        self.subscribers.lock().expect("cluster subscribers lock poisoned").clear();
    }

    /// Make the next N subscribe calls fail.
    #[cfg(test)]
    pub fn fail_next_subscribes(&self, count: usize) {
        *self.fail_subscribes.lock().expect("cluster fail counter lock poisoned") = count;
    }

    /// The number of live subscriptions.
    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("cluster subscribers lock poisoned").len()
    }
}

impl ClusterManager for MemoryCluster {
    fn subscribe(&self) -> BoxFuture<'_, Result<mpsc::Receiver<()>>> {
        Box::pin(async move {
            {
                let mut failures = self.fail_subscribes.lock().expect("cluster fail counter lock poisoned");
                if *failures > 0 {
                    *failures -= 1;
                    bail!("cluster manager unavailable");
                }
            }
            let (tx, rx) = mpsc::channel(1);
            self.subscribers.lock().expect("cluster subscribers lock poisoned").push(tx);
            Ok(rx)
        })
    }

    fn eventing_members(&self) -> BoxFuture<'_, Result<Vec<Member>>> {
        Box::pin(async move { Ok(self.members.read().expect("cluster members lock poisoned").clone()) })
    }

    fn data_members(&self) -> BoxFuture<'_, Result<Vec<Member>>> {
        Box::pin(async move { Ok(self.members.read().expect("cluster members lock poisoned").clone()) })
    }
}

/// Per-node rebalance progress, as reported by a node's admin surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceProgress {
    /// The number of vbuckets this node still needs to shed or acquire.
    pub vbs_remaining_to_shuffle: u64,
    /// The number of vbuckets this node owns per the current plan.
    pub vbs_owned_per_plan: u64,
}

impl RebalanceProgress {
    /// Fold another node's progress into this aggregate.
    pub fn merge(&mut self, other: &RebalanceProgress) {
        self.vbs_remaining_to_shuffle += other.vbs_remaining_to_shuffle;
        self.vbs_owned_per_plan += other.vbs_owned_per_plan;
    }
}

/// The client surface for outbound queries to peer nodes.
pub trait PeerClient: Send + Sync + 'static {
    /// Query the given node's admin surface for applications still bootstrapping.
    fn get_bootstrapping_apps(&self, addr: String) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Query the given node's admin surface for its rebalance progress.
    fn get_rebalance_progress(&self, addr: String) -> BoxFuture<'_, Result<RebalanceProgress>>;

    /// Query a producer's status listener for its rebalance status.
    fn get_rebalance_status(&self, addr: String) -> BoxFuture<'_, Result<bool>>;
}

/// A `PeerClient` backed by a plain HTTP/1 client with the fixed request timeout.
pub struct HttpPeerClient {
    client: hyper::Client<hyper::client::HttpConnector>,
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self { client: hyper::Client::new() }
    }
}

impl HttpPeerClient {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, addr: &str, path: &str) -> Result<T> {
        let uri: hyper::Uri = format!("http://{}{}", addr, path).parse().context("error building peer query URI")?;
        let res = tokio::time::timeout(PEER_REQUEST_TIMEOUT, self.client.get(uri))
            .await
            .context("peer query timed out")?
            .context("error querying peer node")?;
        if !res.status().is_success() {
            bail!("peer query returned non-success status {}", res.status());
        }
        let body = hyper::body::to_bytes(res.into_body()).await.context("error reading peer response body")?;
        serde_json::from_slice(&body).context("error decoding peer response body")
    }
}

impl PeerClient for HttpPeerClient {
    fn get_bootstrapping_apps(&self, addr: String) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move { self.get_json(&addr, "/getBootstrappingApps").await })
    }

    fn get_rebalance_progress(&self, addr: String) -> BoxFuture<'_, Result<RebalanceProgress>> {
        Box::pin(async move { self.get_json(&addr, "/getRebalanceProgress").await })
    }

    fn get_rebalance_status(&self, addr: String) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { self.get_json(&addr, "/getRebalanceStatus").await })
    }
}

/// Check bootstrap status across all of the given nodes.
///
/// Any per-node query failure, or any application still bootstrapping anywhere,
/// fails the whole operation. There is no partial/degraded success path here, as
/// this guards rebalance admission.
pub async fn get_agg_bootstrapping_apps(peers: &dyn PeerClient, addrs: &[String]) -> Result<()> {
    let queries = addrs.iter().map(|addr| peers.get_bootstrapping_apps(addr.clone()));
    let results = futures::future::try_join_all(queries).await.context("error querying bootstrap status across eventing nodes")?;
    let bootstrapping: Vec<String> = results.into_iter().flatten().collect();
    if !bootstrapping.is_empty() {
        bail!("apps undergoing bootstrap on some/all eventing nodes: {:?}", bootstrapping);
    }
    Ok(())
}

/// A scripted `PeerClient` used by tests.
#[cfg(test)]
#[derive(Default)]
pub struct StaticPeerClient {
    bootstrapping: RwLock<HashMap<String, Vec<String>>>,
    progress: RwLock<HashMap<String, RebalanceProgress>>,
}

#[cfg(test)]
impl StaticPeerClient {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the set of bootstrapping apps reported by the given node.
    pub fn set_bootstrapping(&self, addr: &str, apps: Vec<String>) {
        self.bootstrapping.write().expect("peer fixtures lock poisoned").insert(addr.into(), apps);
    }

    /// Script the rebalance progress reported by the given node.
    pub fn set_progress(&self, addr: &str, progress: RebalanceProgress) {
        self.progress.write().expect("peer fixtures lock poisoned").insert(addr.into(), progress);
    }
}

#[cfg(test)]
impl PeerClient for StaticPeerClient {
    fn get_bootstrapping_apps(&self, addr: String) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            match self.bootstrapping.read().expect("peer fixtures lock poisoned").get(&addr) {
                Some(apps) => Ok(apps.clone()),
                None => Ok(Vec::new()),
            }
        })
    }

    fn get_rebalance_progress(&self, addr: String) -> BoxFuture<'_, Result<RebalanceProgress>> {
        Box::pin(async move {
            match self.progress.read().expect("peer fixtures lock poisoned").get(&addr) {
                Some(progress) => Ok(*progress),
                None => Ok(RebalanceProgress::default()),
            }
        })
    }

    fn get_rebalance_status(&self, addr: String) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let progress = self.progress.read().expect("peer fixtures lock poisoned");
            Ok(progress.get(&addr).map(|progress| progress.vbs_remaining_to_shuffle > 0).unwrap_or(false))
        })
    }
}
