//! Top-level coordinator of per-application producers.
//!
//! The SuperSupervisor owns the supervisor tree, the app-name to running
//! producer map, and the app-name to service-token arena. Application load and
//! unload commands arrive over a bounded command channel fed by the metadata
//! store's watch callback and are consumed by a single command loop, so all
//! transitions for a given application are totally ordered: notify the old
//! instance, remove it from the tree, await its shutdown acknowledgment, then
//! spawn the replacement. No two live instances of one application ever hold
//! overlapping vbucket ownership.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::{ClusterManager, PeerClient, RebalanceProgress};
use crate::config::Config;
use crate::metakv::{MetadataStore, METAKV_PRODUCER_HOSTPORTS_PATH};
use crate::producer::Producer;
use crate::server::{spawn_status_server, StatusState};
use crate::suptree::{ServiceToken, SupervisorTree};

/// The capacity of the command channel.
///
/// A full channel applies backpressure to the watch delivery rather than
/// dropping: a delayed redeploy beats a silently lost one.
const SUP_CMD_CHANNEL_CAP: usize = 10;
/// The bound applied to waiting for a stopped producer's acknowledgment.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// All running producers mapped from their application name.
pub type RunningProducersMap = Arc<ArcSwap<HashMap<String, Arc<Producer>>>>;

enum SupervisorCmd {
    Load(String),
    Unload(String),
}

/// A handle to the running SuperSupervisor.
#[derive(Clone)]
pub struct SuperSupervisor {
    cmd_tx: mpsc::Sender<SupervisorCmd>,
    running: RunningProducersMap,
}

impl SuperSupervisor {
    /// Callback registered against the metadata store's apps & settings prefixes.
    ///
    /// Extracts the application name from the written path and enqueues the
    /// matching command. Safe to call concurrently; a full command channel
    /// blocks the send rather than dropping the command.
    pub async fn event_handler_load_callback(&self, path: &str, value: Option<&[u8]>, rev: u64) -> Result<()> {
        let app_name = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string();
        if app_name.is_empty() {
            return Ok(());
        }
        tracing::debug!(app = %app_name, %path, rev, "app config change observed");
        let cmd = match value {
            Some(value) if !value.is_empty() => SupervisorCmd::Load(app_name),
            _ => SupervisorCmd::Unload(app_name),
        };
        self.cmd_tx.send(cmd).await.map_err(|_| anyhow!("supervisor command loop is no longer running"))
    }

    /// A snapshot of all running producers.
    pub fn running_producers(&self) -> Arc<HashMap<String, Arc<Producer>>> {
        self.running.load_full()
    }

    /// Fan the retained-node set of an incoming topology change out to every
    /// running producer, so they can pre-stage vbucket ownership.
    pub fn notify_prepare_topology_change(&self, keep_nodes: &[String]) {
        for producer in self.running.load().values() {
            producer.notify_prepare_topology_change(keep_nodes.to_vec());
        }
    }

    /// The applications on this node which have not finished bootstrapping.
    pub fn bootstrapping_apps(&self) -> Vec<String> {
        self.running
            .load()
            .iter()
            .filter(|(_, producer)| !producer.is_bootstrapped())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// This node's aggregate rebalance progress across all running producers.
    pub fn rebalance_progress(&self) -> RebalanceProgress {
        let mut progress = RebalanceProgress::default();
        for producer in self.running.load().values() {
            progress.merge(&producer.rebalance_progress());
        }
        progress
    }
}

/// The command loop behind the `SuperSupervisor` handle.
pub struct SuperSupervisorCore {
    config: Arc<Config>,
    metakv: Arc<dyn MetadataStore>,
    cluster: Arc<dyn ClusterManager>,
    peers: Arc<dyn PeerClient>,
    tree: SupervisorTree,

    cmd_rx: mpsc::Receiver<SupervisorCmd>,
    running: RunningProducersMap,
    tokens: HashMap<String, ServiceToken>,
    acks: HashMap<String, mpsc::Receiver<()>>,
    servers: HashMap<String, JoinHandle<Result<()>>>,
    server_stops: HashMap<String, watch::Sender<bool>>,

    shutdown_rx: BroadcastStream<()>,
}

impl SuperSupervisorCore {
    /// Create a new instance along with its public handle.
    pub fn new(
        config: Arc<Config>, metakv: Arc<dyn MetadataStore>, cluster: Arc<dyn ClusterManager>, peers: Arc<dyn PeerClient>, tree: SupervisorTree,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (SuperSupervisor, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(SUP_CMD_CHANNEL_CAP);
        let running: RunningProducersMap = Default::default();
        (
            SuperSupervisor { cmd_tx, running: running.clone() },
            Self {
                config,
                metakv,
                cluster,
                peers,
                tree,
                cmd_rx,
                running,
                tokens: HashMap::new(),
                acks: HashMap::new(),
                servers: HashMap::new(),
                server_stops: HashMap::new(),
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            },
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("super supervisor command loop initialized");
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    SupervisorCmd::Load(app_name) => self.handle_load(app_name).await,
                    SupervisorCmd::Unload(app_name) => self.handle_unload(app_name).await,
                },
                _ = self.shutdown_rx.next() => break,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_load(&mut self, app_name: String) {
        tracing::info!(app = %app_name, running = self.running.load().len(), "loading app");
        self.stop_app(&app_name).await;
        self.spawn_app(app_name).await;
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_unload(&mut self, app_name: String) {
        tracing::info!(app = %app_name, running = self.running.load().len(), "unloading app");
        self.stop_app(&app_name).await;
        let hostports_path = format!("{}{}/", METAKV_PRODUCER_HOSTPORTS_PATH, app_name);
        if let Err(err) = self.metakv.recursive_delete(hostports_path).await {
            tracing::error!(error = ?err, app = %app_name, "failed to clear hostport addrs from metadata store");
        }
    }

    /// Stop the running instance of the given app, if any.
    ///
    /// Order matters here: notify the old instance of its successor, remove it
    /// from the tree (which awaits its run loop exit), then await its shutdown
    /// acknowledgment. Only then may a replacement be spawned.
    async fn stop_app(&mut self, app_name: &str) {
        let old = {
            let orig = self.running.load_full();
            if !orig.contains_key(app_name) {
                return;
            }
            let mut updated = orig.as_ref().clone();
            let old = updated.remove(app_name);
            self.running.store(Arc::new(updated));
            match old {
                Some(old) => old,
                None => return,
            }
        };
        tracing::info!(app = %app_name, "cleaning up previous running instance");

        if tokio::time::timeout(SHUTDOWN_ACK_TIMEOUT, old.notify_init()).await.is_err() {
            tracing::error!(app = %app_name, "timed out notifying previous instance of its successor");
        }
        if let Some(token) = self.tokens.remove(app_name) {
            if let Err(err) = self.tree.remove(token).await {
                tracing::error!(error = ?err, app = %app_name, "error removing producer from supervisor tree");
            }
        }
        if let Some(mut ack_rx) = self.acks.remove(app_name) {
            if tokio::time::timeout(SHUTDOWN_ACK_TIMEOUT, ack_rx.recv()).await.is_err() {
                tracing::error!(app = %app_name, "timed out awaiting producer shutdown acknowledgment");
            }
        }
        if let Some(stop_tx) = self.server_stops.remove(app_name) {
            let _res = stop_tx.send(true);
        }
        if let Some(server) = self.servers.remove(app_name) {
            if let Err(err) = server.await.context("error joining status server handle").and_then(|res| res) {
                tracing::error!(error = ?err, app = %app_name, "error shutting down status server");
            }
        }
        tracing::info!(app = %app_name, "cleaned up previous running producer instance");
    }

    /// Spawn a fresh producer for the given app and register it in the tree.
    ///
    /// Bind or publish failures are fatal to this spawn attempt; they are
    /// logged and the attempt is abandoned.
    async fn spawn_app(&mut self, app_name: String) {
        let hostports_path = format!("{}{}/", METAKV_PRODUCER_HOSTPORTS_PATH, app_name);
        if let Err(err) = self.metakv.recursive_delete(hostports_path.clone()).await {
            tracing::error!(error = ?err, app = %app_name, "failed to clear previous hostport addrs from metadata store");
            return;
        }

        let (producer, ack_rx) = Producer::new(app_name.clone(), self.config.clone(), self.cluster.clone());

        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = ?err, app = %app_name, "listen failed for producer status server");
                return;
            }
        };
        if let Err(err) = listener.set_nonblocking(true) {
            tracing::error!(error = ?err, app = %app_name, "error preparing producer status listener");
            return;
        }
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::error!(error = ?err, app = %app_name, "error resolving producer status listener address");
                return;
            }
        };
        tracing::info!(app = %app_name, %addr, "listening on host string");

        if let Err(err) = self.metakv.set(format!("{}{}", hostports_path, addr), addr.to_string().into_bytes()).await {
            tracing::error!(error = ?err, app = %app_name, "failed to store hostport into metadata store");
            return;
        }

        let (server_stop_tx, server_stop_rx) = watch::channel(false);
        let state = StatusState {
            producer: producer.clone(),
            metakv: self.metakv.clone(),
            peers: self.peers.clone(),
            hostports_path,
            local_addr: addr.to_string(),
        };
        let server = match spawn_status_server(listener, state, server_stop_rx) {
            Ok(server) => server,
            Err(err) => {
                tracing::error!(error = ?err, app = %app_name, "error spawning producer status server");
                return;
            }
        };

        let token = match self.tree.add(producer.clone()).await {
            Ok(token) => token,
            Err(err) => {
                tracing::error!(error = ?err, app = %app_name, "error registering producer in supervisor tree");
                let _res = server_stop_tx.send(true);
                return;
            }
        };

        self.tokens.insert(app_name.clone(), token);
        self.acks.insert(app_name.clone(), ack_rx);
        self.servers.insert(app_name.clone(), server);
        self.server_stops.insert(app_name.clone(), server_stop_tx);

        let orig = self.running.load_full();
        let mut updated = orig.as_ref().clone();
        updated.insert(app_name, producer);
        self.running.store(Arc::new(updated));
    }

    async fn shutdown(&mut self) {
        tracing::debug!("super supervisor shutting down");
        for (_, stop_tx) in self.server_stops.drain() {
            let _res = stop_tx.send(true);
        }
        for (app_name, server) in self.servers.drain() {
            if let Err(err) = server.await.context("error joining status server handle").and_then(|res| res) {
                tracing::error!(error = ?err, app = %app_name, "error shutting down status server");
            }
        }
        tracing::debug!("super supervisor shutdown complete");
    }
}
