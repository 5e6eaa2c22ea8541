use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};

use super::{Service, SupervisorTree};

/// A scripted service which fails its first N serves, then runs until shutdown.
struct TestService {
    name: String,
    serves: AtomicUsize,
    fail_first: usize,
    stop_tx: watch::Sender<bool>,
}

impl TestService {
    fn new(name: &str, fail_first: usize) -> Arc<Self> {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            serves: AtomicUsize::new(0),
            fail_first,
            stop_tx,
        })
    }

    fn serve_count(&self) -> usize {
        self.serves.load(Ordering::SeqCst)
    }
}

impl Service for TestService {
    fn name(&self) -> &str {
        &self.name
    }

    fn serve(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let run = self.serves.fetch_add(1, Ordering::SeqCst);
            if run < self.fail_first {
                bail!("scripted failure");
            }
            let mut stop_rx = self.stop_tx.subscribe();
            loop {
                if *stop_rx.borrow() {
                    return Ok(());
                }
                if stop_rx.changed().await.is_err() {
                    return Ok(());
                }
            }
        })
    }

    fn shutdown(&self) {
        let _res = self.stop_tx.send(true);
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for condition: {}", what);
}

#[tokio::test(start_paused = true)]
async fn service_is_restarted_after_unexpected_exit() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tree, _tree_handle) = SupervisorTree::new(shutdown_tx.clone());
    let service = TestService::new("restarts", 1);

    let _token = tree.add(service.clone()).await?;
    wait_for(|| service.serve_count() >= 2, "service to be restarted after its first failure").await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn remove_stops_service_and_invalidates_token() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tree, _tree_handle) = SupervisorTree::new(shutdown_tx.clone());
    let service = TestService::new("removable", 0);

    let token = tree.add(service.clone()).await?;
    wait_for(|| service.serve_count() == 1, "service to start").await;

    tree.remove(token).await?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(service.serve_count(), 1, "expected no restart after removal, got {} serves", service.serve_count());

    // A second removal of the same token is a no-op.
    tree.remove(token).await?;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restart_intensity_abandons_crash_looping_service() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tree, _tree_handle) = SupervisorTree::new(shutdown_tx.clone());
    let service = TestService::new("crash-loop", usize::MAX);

    let _token = tree.add(service.clone()).await?;
    wait_for(|| service.serve_count() >= super::MAX_RESTARTS + 1, "restart intensity to be reached").await;

    let after = service.serve_count();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(service.serve_count(), after, "expected service to be abandoned, got {} serves after {}", service.serve_count(), after);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn tree_shutdown_stops_all_services() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tree, tree_handle) = SupervisorTree::new(shutdown_tx.clone());
    let one = TestService::new("one", 0);
    let two = TestService::new("two", 0);
    tree.add(one.clone()).await?;
    tree.add(two.clone()).await?;
    wait_for(|| one.serve_count() == 1 && two.serve_count() == 1, "both services to start").await;

    let _res = shutdown_tx.send(());
    tree_handle.await??;

    assert!(*one.stop_tx.borrow(), "expected service one to have been signaled to stop");
    assert!(*two.stop_tx.borrow(), "expected service two to have been signaled to stop");

    Ok(())
}
