//! Metadata store collaborator boundary.
//!
//! The metadata store is the single source of truth for which applications are
//! configured to run and for ephemeral producer endpoint registrations. The core
//! consumes a narrow surface: `set`, prefix listing, recursive prefix delete, and
//! prefix watches which fire a callback for every effective write. Subscription
//! retry/reconnect is the collaborator's job; the core only owns the registration
//! handle and tears it down deterministically on shutdown.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use futures::future::BoxFuture;

/// The metadata path prefix under which all eventing state lives.
pub const METAKV_EVENTING_PATH: &str = "/eventing/";
/// The metadata path prefix under which application definitions are stored.
pub const METAKV_APPS_PATH: &str = "/eventing/apps/";
/// The metadata path prefix under which application settings are stored.
pub const METAKV_APP_SETTINGS_PATH: &str = "/eventing/settings/";
/// The metadata path prefix under which producers register their ephemeral host:port.
pub const METAKV_PRODUCER_HOSTPORTS_PATH: &str = "/eventing/producer_hostports/";
/// The metadata key under which the retained-node set is persisted during topology changes.
pub const METAKV_KEEP_NODES_PATH: &str = "/eventing/rebalance/keep_nodes";

/// A callback registered against a metadata prefix watch.
///
/// Fired with the written path, the new value (`None` for deletions) and the store
/// revision of the write. Implementations must not assume delivery ordering across
/// distinct prefixes.
pub type WatchCallback = Arc<dyn Fn(String, Option<Vec<u8>>, u64) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The surface of the external metadata store consumed by this crate.
pub trait MetadataStore: Send + Sync + 'static {
    /// Set the given key to the given value.
    fn set(&self, key: String, value: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    /// List all keys under the given prefix along with their values.
    fn list_prefix(&self, prefix: String) -> BoxFuture<'_, Result<Vec<(String, Vec<u8>)>>>;

    /// Delete all keys under the given prefix.
    fn recursive_delete(&self, prefix: String) -> BoxFuture<'_, Result<()>>;

    /// Register a callback to be fired for every effective write under the given prefix.
    fn watch_prefix(&self, prefix: String, callback: WatchCallback) -> BoxFuture<'_, Result<WatchHandle>>;
}

/// A registration handle for a prefix watch.
///
/// Dropping the handle cancels the watch, so subscriptions never leak across
/// restarts of their owner.
pub struct WatchHandle {
    canceler: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    /// Create a new instance from the store-specific cancellation routine.
    pub fn new(canceler: Box<dyn FnOnce() + Send>) -> Self {
        Self { canceler: Some(canceler) }
    }

    /// Cancel the watch explicitly.
    pub fn cancel(mut self) {
        if let Some(canceler) = self.canceler.take() {
            canceler();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(canceler) = self.canceler.take() {
            canceler();
        }
    }
}

/// An in-memory metadata store used by the binary's local mode and by tests.
#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<HashMap<u64, (String, WatchCallback)>>,
    next_watch_id: AtomicU64,
    rev: AtomicU64,
}

impl MemoryMetadataStore {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value of the given key, if present.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.data.read().expect("metadata lock poisoned").get(key).cloned()
    }

    /// Collect the callbacks watching a prefix of the given path.
    fn watchers_of(&self, path: &str) -> Vec<WatchCallback> {
        let watchers = self.inner.watchers.lock().expect("metadata watchers lock poisoned");
        watchers.values().filter(|(prefix, _)| path.starts_with(prefix.as_str())).map(|(_, cb)| cb.clone()).collect()
    }

    async fn notify(&self, path: String, value: Option<Vec<u8>>, rev: u64) {
        for callback in self.watchers_of(&path) {
            if let Err(err) = callback(path.clone(), value.clone(), rev).await {
                tracing::error!(error = ?err, %path, "error from metadata watch callback");
            }
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn set(&self, key: String, value: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let rev = self.inner.rev.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.data.write().expect("metadata lock poisoned").insert(key.clone(), value.clone());
            self.notify(key, Some(value), rev).await;
            Ok(())
        })
    }

    fn list_prefix(&self, prefix: String) -> BoxFuture<'_, Result<Vec<(String, Vec<u8>)>>> {
        Box::pin(async move {
            let data = self.inner.data.read().expect("metadata lock poisoned");
            Ok(data.range(prefix.clone()..).take_while(|(key, _)| key.starts_with(&prefix)).map(|(k, v)| (k.clone(), v.clone())).collect())
        })
    }

    fn recursive_delete(&self, prefix: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let removed: Vec<String> = {
                let mut data = self.inner.data.write().expect("metadata lock poisoned");
                let keys: Vec<String> = data.range(prefix.clone()..).take_while(|(key, _)| key.starts_with(&prefix)).map(|(k, _)| k.clone()).collect();
                for key in &keys {
                    data.remove(key);
                }
                keys
            };
            for key in removed {
                let rev = self.inner.rev.fetch_add(1, Ordering::SeqCst) + 1;
                self.notify(key, None, rev).await;
            }
            Ok(())
        })
    }

    fn watch_prefix(&self, prefix: String, callback: WatchCallback) -> BoxFuture<'_, Result<WatchHandle>> {
        Box::pin(async move {
            let id = self.inner.next_watch_id.fetch_add(1, Ordering::SeqCst);
            self.inner.watchers.lock().expect("metadata watchers lock poisoned").insert(id, (prefix, callback));
            let inner = self.inner.clone();
            Ok(WatchHandle::new(Box::new(move || {
                inner.watchers.lock().expect("metadata watchers lock poisoned").remove(&id);
            })))
        })
    }
}

#[cfg(test)]
mod metakv_test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;

    use super::*;

    #[tokio::test]
    async fn watch_fires_for_every_effective_write_under_prefix() -> Result<()> {
        let store = MemoryMetadataStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = hits.clone();
        let callback: WatchCallback = Arc::new(move |_path, _value, _rev| {
            let hits = cb_hits.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let handle = store.watch_prefix(METAKV_APPS_PATH.into(), callback).await?;

        store.set(format!("{}app_one", METAKV_APPS_PATH), b"{}".to_vec()).await?;
        store.set(format!("{}app_two", METAKV_APPS_PATH), b"{}".to_vec()).await?;
        store.set("/eventing/other/key".into(), b"{}".to_vec()).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 2, "expected 2 callback hits, got {}", hits.load(Ordering::SeqCst));

        store.recursive_delete(METAKV_APPS_PATH.into()).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 4, "expected deletion callbacks for both keys, got {}", hits.load(Ordering::SeqCst));

        handle.cancel();
        store.set(format!("{}app_three", METAKV_APPS_PATH), b"{}".to_vec()).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 4, "expected no callback hits after cancel, got {}", hits.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn recursive_delete_is_scoped_to_the_prefix() -> Result<()> {
        let store = MemoryMetadataStore::new();
        store.set(format!("{}app_one/one", METAKV_PRODUCER_HOSTPORTS_PATH), b"a".to_vec()).await?;
        store.set(format!("{}app_two/two", METAKV_PRODUCER_HOSTPORTS_PATH), b"b".to_vec()).await?;

        store.recursive_delete(format!("{}app_one/", METAKV_PRODUCER_HOSTPORTS_PATH)).await?;

        let remaining = store.list_prefix(METAKV_PRODUCER_HOSTPORTS_PATH.into()).await?;
        assert_eq!(remaining.len(), 1, "expected a single registration to survive, got {}", remaining.len());
        assert!(
            remaining[0].0.contains("app_two"),
            "expected the surviving registration to belong to app_two, got {}",
            remaining[0].0
        );

        Ok(())
    }
}
