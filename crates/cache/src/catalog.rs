//! Live catalogs of served types and namespaces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info};

use mirra_cluster::{queue_cap, ClusterApi};
use mirra_core::{NamespaceRecord, TypeDefinition, WatchEvent};

use crate::manager::InstanceCacheManager;
use crate::supervisor::supervise;

/// Group family owned by the cluster's own machinery; its types are never
/// fanned out to instance watches.
pub fn infrastructure_native(group: &str) -> bool {
    group.is_empty() || group == "k8s.io" || group.ends_with(".k8s.io")
}

/// Maintains the live set of type definitions and fans newly served types
/// out to the instance cache.
pub struct TypeCatalog {
    definitions: Arc<Mutex<HashMap<(String, String), TypeDefinition>>>,
    event_task: tokio::task::JoinHandle<()>,
    watch_task: tokio::task::JoinHandle<()>,
}

impl TypeCatalog {
    pub fn spawn(cluster: Arc<dyn ClusterApi>, manager: Arc<InstanceCacheManager>) -> Self {
        let definitions: Arc<Mutex<HashMap<(String, String), TypeDefinition>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel::<WatchEvent<TypeDefinition>>(queue_cap());

        let watch_task = tokio::spawn({
            let cluster = cluster.clone();
            async move {
                supervise(
                    "types".into(),
                    move || {
                        let cluster = cluster.clone();
                        async move { cluster.watch_types().await }
                    },
                    tx,
                )
                .await;
            }
        });

        let event_task = tokio::spawn({
            let definitions = Arc::clone(&definitions);
            async move {
                while let Some(ev) = rx.recv().await {
                    match ev {
                        WatchEvent::Added(def) | WatchEvent::Updated(def) => {
                            Self::admit(&definitions, &manager, def);
                        }
                        WatchEvent::Listed(defs) => {
                            definitions.lock().unwrap().clear();
                            for def in defs {
                                Self::admit(&definitions, &manager, def);
                            }
                        }
                        WatchEvent::Deleted(def) => {
                            definitions.lock().unwrap().remove(&def.catalog_key());
                            // The instance watch stays up: tearing it down
                            // races against an immediate redefinition of the
                            // same type. Watches close at shutdown.
                            info!(kind = %def.kind, group = %def.group, "type removed from catalog");
                        }
                    }
                }
                debug!("type catalog event task ended");
            }
        });

        Self { definitions, event_task, watch_task }
    }

    fn admit(
        definitions: &Mutex<HashMap<(String, String), TypeDefinition>>,
        manager: &InstanceCacheManager,
        def: TypeDefinition,
    ) {
        let changed = {
            let mut defs = definitions.lock().unwrap();
            let changed = match defs.get(&def.catalog_key()) {
                Some(prev) => {
                    prev.plural != def.plural || prev.served_version != def.served_version
                }
                None => true,
            };
            defs.insert(def.catalog_key(), def.clone());
            changed
        };
        if changed && !infrastructure_native(&def.group) {
            manager.ensure_watching(&def);
        }
    }

    pub fn definitions(&self) -> Vec<TypeDefinition> {
        let mut out: Vec<TypeDefinition> =
            self.definitions.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.group.cmp(&b.group).then_with(|| a.kind.cmp(&b.kind)));
        out
    }

    pub fn lookup(&self, kind: &str) -> Option<TypeDefinition> {
        self.definitions
            .lock()
            .unwrap()
            .values()
            .find(|d| d.kind == kind)
            .cloned()
    }

    pub fn shutdown(&self) {
        self.watch_task.abort();
        self.event_task.abort();
    }
}

/// Maintains the live set of namespace names. Informational only: instance
/// buckets are watched cluster-wide regardless of which namespaces exist.
pub struct NamespaceCatalog {
    names: Arc<Mutex<HashMap<String, NamespaceRecord>>>,
    event_task: tokio::task::JoinHandle<()>,
    watch_task: tokio::task::JoinHandle<()>,
}

impl NamespaceCatalog {
    pub fn spawn(cluster: Arc<dyn ClusterApi>) -> Self {
        let names: Arc<Mutex<HashMap<String, NamespaceRecord>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel::<WatchEvent<NamespaceRecord>>(queue_cap());

        let watch_task = tokio::spawn({
            let cluster = cluster.clone();
            async move {
                supervise(
                    "namespaces".into(),
                    move || {
                        let cluster = cluster.clone();
                        async move { cluster.watch_namespaces().await }
                    },
                    tx,
                )
                .await;
            }
        });

        let event_task = tokio::spawn({
            let names = Arc::clone(&names);
            async move {
                while let Some(ev) = rx.recv().await {
                    let mut names = names.lock().unwrap();
                    match ev {
                        WatchEvent::Added(ns) | WatchEvent::Updated(ns) => {
                            names.insert(ns.name.clone(), ns);
                        }
                        WatchEvent::Deleted(ns) => {
                            names.remove(&ns.name);
                        }
                        WatchEvent::Listed(list) => {
                            names.clear();
                            for ns in list {
                                names.insert(ns.name.clone(), ns);
                            }
                        }
                    }
                }
                debug!("namespace catalog event task ended");
            }
        });

        Self { names, event_task, watch_task }
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.names.lock().unwrap().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn shutdown(&self) {
        self.watch_task.abort();
        self.event_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_group_family() {
        assert!(infrastructure_native(""));
        assert!(infrastructure_native("apiextensions.k8s.io"));
        assert!(infrastructure_native("k8s.io"));
        assert!(!infrastructure_native("widgets.fabric.dev"));
        assert!(!infrastructure_native("fork8s.example.com"));
    }
}
