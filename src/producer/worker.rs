//! Worker execution units.
//!
//! A worker owns a subset of its producer's vbuckets and the listener over which
//! the data-service feed for those vbuckets is delivered. The event dispatch
//! engine behind the feed is opaque to the control plane; what matters here is
//! lifecycle (spawn, pause, resume, stop) and the processing stats surfaced
//! through the producer's status RPC.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::StreamBoundary;

/// The interval at which a worker drains queued events.
const PROCESS_TICK: Duration = Duration::from_millis(5);

/// Control messages understood by a worker's run loop.
#[derive(Debug)]
pub enum WorkerMsg {
    /// Drain and exit.
    Stop,
}

/// Processing stats shared between a worker task and its handle.
#[derive(Default)]
pub struct WorkerStats {
    queued: AtomicU64,
    vb_seqs: RwLock<HashMap<u16, u64>>,
}

impl WorkerStats {
    fn new(vbuckets: &[u16]) -> Arc<Self> {
        let stats = Self::default();
        {
            let mut seqs = stats.vb_seqs.write().expect("worker stats lock poisoned");
            for vb in vbuckets {
                seqs.insert(*vb, 0);
            }
        }
        Arc::new(stats)
    }

    /// The number of events received but not yet processed.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::SeqCst)
    }

    /// The last processed sequence number per owned vbucket.
    pub fn vb_seqs(&self) -> HashMap<u16, u64> {
        self.vb_seqs.read().expect("worker stats lock poisoned").clone()
    }

    /// Record receipt of one event.
    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Record one processed event against the given vbucket.
    pub fn record_processed(&self, vb: u16) {
        let mut seqs = self.vb_seqs.write().expect("worker stats lock poisoned");
        *seqs.entry(vb).or_insert(0) += 1;
        let _res = self.queued.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| queued.checked_sub(1));
    }
}

/// A handle to a spawned worker, owned by its producer.
pub struct WorkerHandle {
    /// The worker's name, unique within its producer.
    pub name: String,
    /// The vbuckets bound to this worker.
    pub vbuckets: Vec<u16>,
    /// The address of the worker's feed listener.
    pub addr: SocketAddr,

    msg_tx: mpsc::Sender<WorkerMsg>,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// This worker's shared processing stats.
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Stop this worker and await its exit.
    pub async fn stop(self) {
        let _res = self.msg_tx.send(WorkerMsg::Stop).await;
        if let Err(err) = self.handle.await {
            tracing::error!(error = ?err, worker = %self.name, "error joining worker task");
        }
    }
}

/// A worker execution unit bound to a subset of a producer's vbuckets.
pub struct Worker {
    name: String,
    app_name: String,
    vbuckets: Vec<u16>,
    boundary: StreamBoundary,
    listener: TcpListener,
    msg_rx: mpsc::Receiver<WorkerMsg>,
    stats: Arc<WorkerStats>,
    next_vb: usize,
}

impl Worker {
    /// Bind this worker's feed listener and spawn its run loop.
    pub async fn spawn(name: String, app_name: String, vbuckets: Vec<u16>, boundary: StreamBoundary) -> Result<WorkerHandle> {
        let listener = TcpListener::bind("127.0.0.1:0").await.context("error binding worker feed listener")?;
        let addr = listener.local_addr().context("error resolving worker feed listener address")?;
        let stats = WorkerStats::new(&vbuckets);
        let (msg_tx, msg_rx) = mpsc::channel(10);
        let worker = Worker {
            name: name.clone(),
            app_name,
            vbuckets: vbuckets.clone(),
            boundary,
            listener,
            msg_rx,
            stats: stats.clone(),
            next_vb: 0,
        };
        let handle = tokio::spawn(worker.run());
        Ok(WorkerHandle { name, vbuckets, addr, msg_tx, stats, handle })
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(
            app = %self.app_name, worker = %self.name, vbuckets = self.vbuckets.len(), boundary = ?self.boundary,
            "worker initialized",
        );
        let mut process_tick = tokio::time::interval(PROCESS_TICK);
        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => match msg {
                    Some(WorkerMsg::Stop) | None => break,
                },
                conn = self.listener.accept() => {
                    match conn {
                        Ok(_conn) => self.stats.record_queued(),
                        Err(err) => tracing::error!(error = ?err, worker = %self.name, "error accepting feed connection"),
                    }
                }
                _ = process_tick.tick() => self.process_one(),
            }
        }
        self.drain();
        tracing::debug!(app = %self.app_name, worker = %self.name, "worker shutdown complete");
        Ok(())
    }

    /// Dispatch one queued event against the next owned vbucket.
    fn process_one(&mut self) {
        if self.stats.queued() == 0 || self.vbuckets.is_empty() {
            return;
        }
        let vb = self.vbuckets[self.next_vb % self.vbuckets.len()];
        self.next_vb = self.next_vb.wrapping_add(1);
        self.stats.record_processed(vb);
    }

    /// Process any queued events before exit.
    fn drain(&mut self) {
        while self.stats.queued() > 0 && !self.vbuckets.is_empty() {
            self.process_one();
        }
    }
}
