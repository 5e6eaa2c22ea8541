//! Application assembly & lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::cluster::{ClusterManager, HttpPeerClient, Member, MemoryCluster};
use crate::config::Config;
use crate::metakv::{MemoryMetadataStore, MetadataStore, WatchCallback, WatchHandle, METAKV_APPS_PATH, METAKV_APP_SETTINGS_PATH};
use crate::server::spawn_admin_server;
use crate::service::ServiceMgr;
use crate::supersup::SuperSupervisorCore;
use crate::suptree::SupervisorTree;

/// The application object for when the eventing controller is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The service manager registered against the cluster orchestrator.
    _service_mgr: Arc<ServiceMgr>,
    /// Watch registrations torn down on shutdown.
    watches: Vec<WatchHandle>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the supervisor tree.
    tree_handle: JoinHandle<Result<()>>,
    /// The join handle of the super supervisor command loop.
    supersup_handle: JoinHandle<Result<()>>,
    /// The join handle of the node admin server.
    admin_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(100);

        // Initialize external collaborators. The metadata store and the cluster
        // manager run in-memory here; deployments swap in the real services at
        // this seam.
        let metakv = Arc::new(MemoryMetadataStore::new());
        let mut cluster = MemoryCluster::from_member_list(&config.cluster_members).context("error parsing cluster members")?;
        if cluster.eventing_members().await?.is_empty() {
            cluster = MemoryCluster::new(vec![Member {
                uuid: config.node_uuid.clone(),
                addr: format!("127.0.0.1:{}", config.admin_port),
            }]);
        }
        let cluster = Arc::new(cluster);
        let peers = Arc::new(HttpPeerClient::new());

        // Spawn various core tasks.
        let (tree, tree_handle) = SupervisorTree::new(shutdown_tx.clone());
        let (super_sup, core) = SuperSupervisorCore::new(config.clone(), metakv.clone(), cluster.clone(), peers.clone(), tree, shutdown_tx.clone());
        let supersup_handle = core.spawn();

        // Register the app load callback against the apps & settings prefixes.
        let callback_sup = super_sup.clone();
        let callback: WatchCallback = Arc::new(move |path, value, rev| {
            let super_sup = callback_sup.clone();
            Box::pin(async move { super_sup.event_handler_load_callback(&path, value.as_deref(), rev).await })
        });
        let watches = vec![
            metakv.watch_prefix(METAKV_APPS_PATH.into(), callback.clone()).await.context("error registering apps watch")?,
            metakv
                .watch_prefix(METAKV_APP_SETTINGS_PATH.into(), callback)
                .await
                .context("error registering settings watch")?,
        ];

        let service_mgr = ServiceMgr::new(config.clone(), super_sup.clone(), metakv, cluster, peers, shutdown_tx.clone());
        tracing::info!(node_info = ?service_mgr.node_info(), "registered against cluster orchestrator");

        let admin_server = spawn_admin_server(&config, super_sup, shutdown_tx.clone()).context("error setting up admin server")?;

        Ok(Self {
            _config: config,
            _service_mgr: service_mgr,
            watches,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            tree_handle,
            supersup_handle,
            admin_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _res = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine. Watches go first so no load commands land on
        // a stopping command loop.
        tracing::debug!("eventing controller is shutting down");
        for watch in self.watches.drain(..) {
            watch.cancel();
        }
        if let Err(err) = self.supersup_handle.await.context("error joining super supervisor handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down super supervisor");
        }
        if let Err(err) = self.tree_handle.await.context("error joining supervisor tree handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down supervisor tree");
        }
        if let Err(err) = self.admin_server.await.context("error joining admin server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down admin server");
        }

        tracing::debug!("eventing controller shutdown complete");
        Ok(())
    }
}
