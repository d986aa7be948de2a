//! Bucket registry with idempotent watch fan-out and a debounced
//! "resources changed" signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use mirra_cluster::ClusterApi;
use mirra_core::{ResourceInstance, TypeDefinition, TypeKey};

use crate::bucket::{spawn_bucket, BucketHandle};

fn debounce_window() -> Duration {
    let ms = std::env::var("MIRRA_REFRESH_DEBOUNCE_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(500);
    Duration::from_millis(ms)
}

/// Marker handed to bucket tasks; marking is cheap and never blocks.
#[derive(Clone)]
pub struct DirtyMark(mpsc::UnboundedSender<()>);

impl DirtyMark {
    pub fn mark(&self) {
        let _ = self.0.send(());
    }
}

/// Coalesces bursts of cache mutations into at most one downstream refresh
/// per window. A mark landing inside a window always produces a trailing
/// refresh, so the final state is never unannounced.
pub struct ChangeNotifier {
    mark_tx: mpsc::UnboundedSender<()>,
    broadcast_tx: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ChangeNotifier {
    pub fn new(window: Duration) -> Self {
        let (mark_tx, mut mark_rx) = mpsc::unbounded_channel::<()>();
        let (broadcast_tx, _) = broadcast::channel(16);
        let task = tokio::spawn({
            let broadcast_tx = broadcast_tx.clone();
            async move {
                while mark_rx.recv().await.is_some() {
                    // Everything queued up to now is covered by this refresh.
                    while mark_rx.try_recv().is_ok() {}
                    let _ = broadcast_tx.send(());
                    tokio::time::sleep(window).await;
                }
            }
        });
        Self { mark_tx, broadcast_tx, task }
    }

    pub fn dirty_mark(&self) -> DirtyMark {
        DirtyMark(self.mark_tx.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.broadcast_tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Owns one bucket per watched type key. The sole source of truth read by
/// presentation layers.
pub struct InstanceCacheManager {
    cluster: Arc<dyn ClusterApi>,
    buckets: Mutex<FxHashMap<TypeKey, BucketHandle>>,
    notifier: ChangeNotifier,
}

impl InstanceCacheManager {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            buckets: Mutex::new(FxHashMap::default()),
            notifier: ChangeNotifier::new(debounce_window()),
        }
    }

    /// Begin watching a type. Idempotent: a second request for an
    /// already-watched key is a no-op. Returns true when a watch was
    /// actually started.
    pub fn ensure_watching(&self, def: &TypeDefinition) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let key = def.key();
        if buckets.contains_key(&key) {
            return false;
        }
        info!(bucket = %key, "starting instance watch");
        let handle = spawn_bucket(def.clone(), self.cluster.clone(), self.notifier.dirty_mark());
        buckets.insert(key, handle);
        true
    }

    pub fn is_watching(&self, key: &TypeKey) -> bool {
        self.buckets.lock().unwrap().contains_key(key)
    }

    pub fn watched_keys(&self) -> Vec<TypeKey> {
        let mut keys: Vec<TypeKey> = self.buckets.lock().unwrap().keys().cloned().collect();
        keys.sort_by_key(|k| k.to_string());
        keys
    }

    /// Cluster-wide point-in-time read. Never blocks; empty until the
    /// bucket's first full list (or when the key is not watched at all).
    pub fn instances(&self, key: &TypeKey) -> Vec<ResourceInstance> {
        self.buckets
            .lock()
            .unwrap()
            .get(key)
            .map(|b| b.items().as_ref().clone())
            .unwrap_or_default()
    }

    /// Namespace-scoped read: a filter over the cluster-wide bucket, since
    /// the watch itself is cluster-wide.
    pub fn instances_in(&self, key: &TypeKey, namespace: &str) -> Vec<ResourceInstance> {
        self.buckets
            .lock()
            .unwrap()
            .get(key)
            .map(|b| {
                b.items()
                    .iter()
                    .filter(|o| o.namespace.as_deref() == Some(namespace))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One-shot readiness signal: resolves once the bucket has applied its
    /// first authoritative list. Returns false for unwatched keys.
    pub async fn wait_ready(&self, key: &TypeKey) -> bool {
        let rx = {
            let buckets = self.buckets.lock().unwrap();
            match buckets.get(key) {
                Some(b) => b.ready_receiver(),
                None => return false,
            }
        };
        let mut rx = rx;
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
        true
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.notifier.subscribe()
    }

    pub fn shutdown(&self) {
        for (_, bucket) in self.buckets.lock().unwrap().iter() {
            bucket.shutdown();
        }
        self.notifier.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    #[tokio::test(start_paused = true)]
    async fn notifier_coalesces_bursts_and_keeps_trailing_refresh() {
        let notifier = ChangeNotifier::new(Duration::from_millis(500));
        let mark = notifier.dirty_mark();
        let mut rx = notifier.subscribe();

        // A burst inside one window yields exactly one leading refresh.
        mark.mark();
        mark.mark();
        mark.mark();
        timeout(Duration::from_secs(1), rx.recv()).await.expect("leading refresh").unwrap();
        assert!(rx.try_recv().is_err());

        // A mark landing inside the window produces a trailing refresh once
        // the window closes, never sooner.
        mark.mark();
        advance(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        timeout(Duration::from_secs(1), rx.recv()).await.expect("trailing refresh").unwrap();

        notifier.shutdown();
    }
}
