//! Supervisor tree.
//!
//! A one-for-one restart supervisor over long-lived services. Each added service
//! gets an opaque token backed by an explicit arena (token -> service record), and
//! is restarted with a fixed delay whenever its run loop returns without a removal
//! having been requested. Restarts re-invoke the service's full startup path, so
//! services must make startup idempotent.
//!
//! Restart intensity is bounded: a service that restarts more than
//! `MAX_RESTARTS` times inside `RESTART_WINDOW` is abandoned with an error log
//! instead of crash-looping the process.

#[cfg(test)]
mod mod_test;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::ERR_TREE_UNAVAILABLE;

/// The delay applied before restarting a service.
const RESTART_DELAY: Duration = Duration::from_secs(1);
/// The maximum number of restarts tolerated inside `RESTART_WINDOW`.
const MAX_RESTARTS: usize = 5;
/// The window over which restart intensity is measured.
const RESTART_WINDOW: Duration = Duration::from_secs(10);
/// The bound applied to waiting for services to exit during tree shutdown.
const SHUTDOWN_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// An opaque handle identifying one supervised service instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServiceToken(u64);

/// A long-lived service which may be supervised by the tree.
pub trait Service: Send + Sync + 'static {
    /// The name of this service, used for logging.
    fn name(&self) -> &str;

    /// Run this service to completion.
    ///
    /// Invoked again after each restart, on the same instance.
    fn serve(self: Arc<Self>) -> BoxFuture<'static, Result<()>>;

    /// Signal this service to begin shutdown; `serve` must then return promptly.
    fn shutdown(&self);
}

enum TreeCmd {
    Add(Arc<dyn Service>, oneshot::Sender<ServiceToken>),
    Remove(ServiceToken, oneshot::Sender<()>),
    Respawn(ServiceToken),
}

/// A handle to a running supervisor tree.
#[derive(Clone)]
pub struct SupervisorTree {
    cmd_tx: mpsc::Sender<TreeCmd>,
}

impl SupervisorTree {
    /// Spawn a new supervisor tree, returning its handle and join handle.
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> (Self, JoinHandle<Result<()>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (exits_tx, exits_rx) = mpsc::channel(100);
        let core = TreeCore {
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            exits_tx,
            exits_rx,
            services: HashMap::new(),
            next_token: 0,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        };
        (Self { cmd_tx }, core.spawn())
    }

    /// Add the given service to the tree, starting it immediately.
    pub async fn add(&self, service: Arc<dyn Service>) -> Result<ServiceToken> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(TreeCmd::Add(service, tx)).await.map_err(|_| anyhow!(ERR_TREE_UNAVAILABLE))?;
        rx.await.context(ERR_TREE_UNAVAILABLE)
    }

    /// Stop and unregister the service identified by the given token.
    ///
    /// Resolves once the service's run loop has exited and the token is invalidated.
    pub async fn remove(&self, token: ServiceToken) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(TreeCmd::Remove(token, tx)).await.map_err(|_| anyhow!(ERR_TREE_UNAVAILABLE))?;
        rx.await.context(ERR_TREE_UNAVAILABLE)
    }
}

struct ServiceRecord {
    service: Arc<dyn Service>,
    restarts: VecDeque<Instant>,
    removal_ack: Option<oneshot::Sender<()>>,
}

struct TreeCore {
    cmd_tx: mpsc::Sender<TreeCmd>,
    cmd_rx: mpsc::Receiver<TreeCmd>,
    exits_tx: mpsc::Sender<(u64, Result<()>)>,
    exits_rx: mpsc::Receiver<(u64, Result<()>)>,
    services: HashMap<u64, ServiceRecord>,
    next_token: u64,
    shutdown_rx: BroadcastStream<()>,
}

impl TreeCore {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("supervisor tree initialized");
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_cmd(cmd),
                Some((token, res)) = self.exits_rx.recv() => self.handle_exit(token, res),
                _ = self.shutdown_rx.next() => break,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    fn handle_cmd(&mut self, cmd: TreeCmd) {
        match cmd {
            TreeCmd::Add(service, ack) => {
                let token = self.next_token;
                self.next_token += 1;
                tracing::info!(service = service.name(), token, "adding service to supervisor tree");
                self.services.insert(token, ServiceRecord { service, restarts: VecDeque::new(), removal_ack: None });
                self.spawn_service(token);
                let _res = ack.send(ServiceToken(token));
            }
            TreeCmd::Remove(ServiceToken(token), ack) => match self.services.get_mut(&token) {
                Some(record) => {
                    tracing::info!(service = record.service.name(), token, "removing service from supervisor tree");
                    record.removal_ack = Some(ack);
                    record.service.shutdown();
                }
                None => {
                    let _res = ack.send(());
                }
            },
            TreeCmd::Respawn(ServiceToken(token)) => {
                if let Some(record) = self.services.get(&token) {
                    if record.removal_ack.is_none() {
                        self.spawn_service(token);
                    }
                }
            }
        }
    }

    fn spawn_service(&self, token: u64) {
        let record = match self.services.get(&token) {
            Some(record) => record,
            None => return,
        };
        let service = record.service.clone();
        let exits_tx = self.exits_tx.clone();
        tokio::spawn(async move {
            let res = service.serve().await;
            let _res = exits_tx.send((token, res)).await;
        });
    }

    fn handle_exit(&mut self, token: u64, res: Result<()>) {
        let mut record = match self.services.remove(&token) {
            Some(record) => record,
            None => return,
        };

        // A requested removal: unregister, invalidate the token & ack the caller.
        if let Some(ack) = record.removal_ack.take() {
            tracing::info!(service = record.service.name(), token, "service removed from supervisor tree");
            let _res = ack.send(());
            return;
        }

        match &res {
            Ok(_) => tracing::warn!(service = record.service.name(), token, "service run loop returned unexpectedly, restarting"),
            Err(err) => tracing::error!(error = ?err, service = record.service.name(), token, "service run loop failed, restarting"),
        }

        let now = Instant::now();
        while record.restarts.front().map(|when| now.duration_since(*when) > RESTART_WINDOW).unwrap_or(false) {
            record.restarts.pop_front();
        }
        if record.restarts.len() >= MAX_RESTARTS {
            tracing::error!(service = record.service.name(), token, "restart intensity exceeded, abandoning service");
            return;
        }
        record.restarts.push_back(now);
        self.services.insert(token, record);

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DELAY).await;
            let _res = cmd_tx.send(TreeCmd::Respawn(ServiceToken(token))).await;
        });
    }

    async fn shutdown(&mut self) {
        tracing::debug!("supervisor tree shutting down");
        for record in self.services.values() {
            record.service.shutdown();
        }
        let deadline = tokio::time::sleep(SHUTDOWN_EXIT_TIMEOUT);
        tokio::pin!(deadline);
        while !self.services.is_empty() {
            tokio::select! {
                Some((token, _res)) = self.exits_rx.recv() => {
                    self.services.remove(&token);
                }
                _ = &mut deadline => {
                    tracing::error!(remaining = self.services.len(), "services failed to exit before shutdown deadline");
                    break;
                }
            }
        }
        tracing::debug!("supervisor tree shutdown complete");
    }
}
