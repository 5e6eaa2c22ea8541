//! Test fixtures shared across module test suites.

use std::sync::Arc;
use std::time::Duration;

use rand::prelude::*;
use tokio::sync::broadcast;

use crate::cluster::{Member, MemoryCluster, StaticPeerClient};
use crate::config::Config;
use crate::metakv::MemoryMetadataStore;
use crate::service::{NodeRef, ServiceMgr, TopologyChange, TopologyChangeType};
use crate::supersup::{SuperSupervisor, SuperSupervisorCore};
use crate::suptree::SupervisorTree;

/// The admin address used for the member at the given position.
pub fn member_addr(idx: usize) -> String {
    format!("127.0.0.1:{}", 9310 + idx)
}

/// Build a member list from the given UUIDs, with positional admin addresses.
pub fn members(uuids: &[&str]) -> Vec<Member> {
    uuids
        .iter()
        .enumerate()
        .map(|(idx, uuid)| Member {
            uuid: uuid.to_string(),
            addr: member_addr(idx),
        })
        .collect()
}

/// Generate a random application name.
pub fn app_name() -> String {
    format!("app_{}", rand::thread_rng().gen_range(0..u32::MAX))
}

/// Build a topology change request retaining the given node UUIDs.
pub fn topology_change(id: &str, change_type: TopologyChangeType, keep: &[&str]) -> TopologyChange {
    TopologyChange {
        id: id.into(),
        current_topology_rev: None,
        change_type,
        keep_nodes: keep.iter().map(|uuid| NodeRef { node_id: uuid.to_string() }).collect(),
        eject_nodes: Vec::new(),
    }
}

/// Poll the given condition until it holds, panicking after a bounded wait.
pub async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for condition: {}", what);
}

/// A fully wired service manager over in-memory collaborators.
pub struct ServiceFixture {
    pub mgr: Arc<ServiceMgr>,
    pub super_sup: SuperSupervisor,
    pub metakv: Arc<MemoryMetadataStore>,
    pub cluster: Arc<MemoryCluster>,
    pub peers: Arc<StaticPeerClient>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Build a service manager over a three node in-memory cluster.
///
/// The super supervisor's command loop is not spawned; producer lifecycle is
/// exercised through the supersup test suite instead.
pub fn service_fixture() -> ServiceFixture {
    let config = Config::new_test();
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(10);
    let (tree, _tree_handle) = SupervisorTree::new(shutdown_tx.clone());
    let metakv = Arc::new(MemoryMetadataStore::new());
    let cluster = Arc::new(MemoryCluster::new(members(&["node-0", "node-1", "node-2"])));
    let peers = Arc::new(StaticPeerClient::new());
    let (super_sup, _core) = SuperSupervisorCore::new(config.clone(), metakv.clone(), cluster.clone(), peers.clone(), tree, shutdown_tx.clone());
    let mgr = ServiceMgr::new(config, super_sup.clone(), metakv.clone(), cluster.clone(), peers.clone(), shutdown_tx.clone());
    ServiceFixture {
        mgr,
        super_sup,
        metakv,
        cluster,
        peers,
        shutdown_tx,
    }
}
