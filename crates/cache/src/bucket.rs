//! Per-type bucket: one subscription, one identity-keyed map, one writer.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use mirra_cluster::{queue_cap, ClusterApi};
use mirra_core::{ResourceInstance, TypeDefinition, TypeKey, Uid, WatchEvent};

use crate::manager::DirtyMark;
use crate::supervisor::supervise;

/// Identity-keyed content of one bucket. Only the bucket's own event task
/// mutates this; everyone else reads frozen snapshots.
#[derive(Default)]
pub(crate) struct BucketState {
    map: FxHashMap<Uid, ResourceInstance>,
}

impl BucketState {
    /// Returns true when the event was an authoritative full list.
    pub(crate) fn apply(&mut self, ev: WatchEvent<ResourceInstance>) -> bool {
        match ev {
            // A duplicate add is an update; an update for an unseen identity
            // is a missed add. Both collapse to insert-or-replace.
            WatchEvent::Added(obj) | WatchEvent::Updated(obj) => {
                self.map.insert(obj.uid, obj);
                false
            }
            WatchEvent::Deleted(obj) => {
                self.map.remove(&obj.uid);
                false
            }
            // A fresh list is authoritative and may drop identities the
            // stream lost track of during an outage.
            WatchEvent::Listed(items) => {
                self.map.clear();
                for obj in items {
                    self.map.insert(obj.uid, obj);
                }
                true
            }
        }
    }

    pub(crate) fn freeze(&self) -> Vec<ResourceInstance> {
        let mut items: Vec<ResourceInstance> = self.map.values().cloned().collect();
        items.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)));
        items
    }
}

/// Read handle plus the two tasks (supervisor, event apply) backing a bucket.
pub struct BucketHandle {
    key: TypeKey,
    snap: Arc<ArcSwap<Vec<ResourceInstance>>>,
    ready_rx: watch::Receiver<bool>,
    event_task: tokio::task::JoinHandle<()>,
    watch_task: tokio::task::JoinHandle<()>,
}

impl BucketHandle {
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Current point-in-time snapshot; empty before the first full list.
    pub fn items(&self) -> Arc<Vec<ResourceInstance>> {
        self.snap.load_full()
    }

    /// True once the first authoritative list landed.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub(crate) fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    pub fn shutdown(&self) {
        self.watch_task.abort();
        self.event_task.abort();
    }
}

/// Start watching one type: spawn the supervised subscription and the event
/// task that owns the map.
pub fn spawn_bucket(
    def: TypeDefinition,
    cluster: Arc<dyn ClusterApi>,
    dirty: DirtyMark,
) -> BucketHandle {
    let key = def.key();
    let snap: Arc<ArcSwap<Vec<ResourceInstance>>> = Arc::new(ArcSwap::from_pointee(Vec::new()));
    let (ready_tx, ready_rx) = watch::channel(false);
    let (tx, mut rx) = mpsc::channel::<WatchEvent<ResourceInstance>>(queue_cap());

    let watch_task = tokio::spawn({
        let label = key.to_string();
        async move {
            supervise(
                label,
                move || {
                    let cluster = cluster.clone();
                    let def = def.clone();
                    async move { cluster.watch_instances(&def).await }
                },
                tx,
            )
            .await;
        }
    });

    let event_task = tokio::spawn({
        let snap = Arc::clone(&snap);
        let label = key.to_string();
        async move {
            let mut state = BucketState::default();
            while let Some(ev) = rx.recv().await {
                let mut listed = state.apply(ev);
                let mut applied = 1u64;
                // Drain whatever is already queued so a burst becomes one
                // snapshot swap.
                while let Ok(ev) = rx.try_recv() {
                    listed |= state.apply(ev);
                    applied += 1;
                }
                metrics::counter!("cache_events_total", applied);
                snap.store(Arc::new(state.freeze()));
                if listed {
                    ready_tx.send_replace(true);
                }
                dirty.mark();
            }
            debug!(bucket = %label, "bucket event task ended");
        }
    });

    BucketHandle { key, snap, ready_rx, event_task, watch_task }
}
