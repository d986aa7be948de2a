//! mirra public façade (in-process).
//!
//! [`Mirra`] is the explicitly constructed context object owning every
//! component: the cluster client, the instance cache, both catalogs, the
//! session registry, and the apply coordinator. Frontends depend on the
//! [`MirraApi`] trait; nothing in the system is reached through ambient
//! global state.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::info;

use mirra_apply::ApplyCoordinator;
use mirra_cache::{InstanceCacheManager, NamespaceCatalog, TypeCatalog};
use mirra_cluster::{ClusterApi, ClusterError};
use mirra_core::{Classification, NamespaceRecord, ResourceInstance, TypeDefinition, TypeKey};
use mirra_session::SessionRegistry;

pub use mirra_apply::{ApplyError, ApplyOptions, ApplyReport, DiffSummary};
pub use mirra_session::EditHandle;

/// Façade errors, flattened for transport to frontends.
#[derive(Debug, thiserror::Error)]
pub enum MirraError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<ApplyError> for MirraError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Validation { field, reason } => {
                MirraError::Validation(format!("{field}: {reason}"))
            }
            ApplyError::Conflict(msg) => MirraError::Conflict(msg),
            ApplyError::Backend(msg) => MirraError::Internal(msg),
        }
    }
}

impl From<ClusterError> for MirraError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Conflict(msg) => MirraError::Conflict(msg),
            ClusterError::NotFound(msg) => MirraError::NotFound(msg),
            ClusterError::Api(msg) => MirraError::Internal(msg),
        }
    }
}

pub type MirraResult<T> = Result<T, MirraError>;

/// Surface consumed by presentation-layer collaborators.
#[async_trait]
pub trait MirraApi: Send + Sync {
    /// One-shot authoritative listing of served custom types.
    async fn discover_types(&self) -> MirraResult<Vec<TypeDefinition>>;

    /// Point-in-time namespace list from the catalog.
    fn namespaces(&self) -> Vec<String>;

    /// Non-blocking cached read; possibly stale until the bucket's first
    /// full list. Pair with [`MirraApi::wait_ready`] when freshness matters.
    fn cached_instances(&self, key: &TypeKey, namespace: Option<&str>) -> Vec<ResourceInstance>;

    async fn wait_ready(&self, key: &TypeKey) -> bool;

    /// Begin watching a type that discovery alone would not fan out
    /// (built-in kinds). Idempotent.
    fn ensure_watching(&self, def: &TypeDefinition) -> bool;

    /// Debounced cache-change signal: at most one tick per window.
    fn subscribe_changes(&self) -> broadcast::Receiver<()>;

    async fn begin_edit(
        &self,
        namespace: Option<&str>,
        kind: &str,
        name: &str,
        origin: Option<Classification>,
    ) -> MirraResult<EditHandle>;

    fn original_snapshot(&self, handle: &EditHandle) -> Json;

    fn has_pending_changes(&self, handle: &EditHandle, proposed: &Json) -> bool;

    fn diff(&self, handle: &EditHandle, proposed: &Json) -> DiffSummary;

    async fn refresh(&self, handle: &EditHandle) -> MirraResult<()>;

    async fn validate_and_apply(
        &self,
        handle: &EditHandle,
        proposed: &Json,
        opts: ApplyOptions,
    ) -> MirraResult<ApplyReport>;

    fn close_view(&self, handle: &EditHandle);

    fn close_edit(&self, handle: &EditHandle, unsaved: bool);
}

struct Catalogs {
    types: TypeCatalog,
    namespaces: NamespaceCatalog,
}

/// The in-process context object.
pub struct Mirra {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<InstanceCacheManager>,
    sessions: SessionRegistry,
    coordinator: ApplyCoordinator,
    catalogs: Mutex<Option<Catalogs>>,
}

impl Mirra {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Arc<Self> {
        let cache = Arc::new(InstanceCacheManager::new(cluster.clone()));
        let sessions = SessionRegistry::new(cluster.clone());
        let coordinator = ApplyCoordinator::new(cluster.clone());
        Arc::new(Self {
            cluster,
            cache,
            sessions,
            coordinator,
            catalogs: Mutex::new(None),
        })
    }

    /// Spawn the catalog watches. Idempotent; the type catalog starts
    /// fanning instance watches out as definitions arrive.
    pub fn start(&self) {
        let mut catalogs = self.catalogs.lock().unwrap();
        if catalogs.is_some() {
            return;
        }
        info!("starting catalogs");
        *catalogs = Some(Catalogs {
            types: TypeCatalog::spawn(self.cluster.clone(), self.cache.clone()),
            namespaces: NamespaceCatalog::spawn(self.cluster.clone()),
        });
    }

    /// Stop every supervised task. Watches end here and nowhere else.
    pub fn shutdown(&self) {
        if let Some(catalogs) = self.catalogs.lock().unwrap().take() {
            catalogs.types.shutdown();
            catalogs.namespaces.shutdown();
        }
        self.cache.shutdown();
        info!("mirra shut down");
    }

    pub fn cluster(&self) -> Arc<dyn ClusterApi> {
        self.cluster.clone()
    }

    pub fn cache(&self) -> &InstanceCacheManager {
        &self.cache
    }

    /// Catalog definitions observed so far (empty before `start`).
    pub fn catalog_types(&self) -> Vec<TypeDefinition> {
        self.catalogs
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.types.definitions())
            .unwrap_or_default()
    }

    pub async fn list_namespaces(&self) -> MirraResult<Vec<NamespaceRecord>> {
        Ok(self.cluster.list_namespaces().await?)
    }
}

#[async_trait]
impl MirraApi for Mirra {
    async fn discover_types(&self) -> MirraResult<Vec<TypeDefinition>> {
        let t0 = Instant::now();
        let kinds = self.cluster.list_types().await?;
        info!(count = kinds.len(), took_ms = %t0.elapsed().as_millis(), "discover ok");
        Ok(kinds)
    }

    fn namespaces(&self) -> Vec<String> {
        self.catalogs
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.namespaces.names())
            .unwrap_or_default()
    }

    fn cached_instances(&self, key: &TypeKey, namespace: Option<&str>) -> Vec<ResourceInstance> {
        match namespace {
            Some(ns) => self.cache.instances_in(key, ns),
            None => self.cache.instances(key),
        }
    }

    async fn wait_ready(&self, key: &TypeKey) -> bool {
        self.cache.wait_ready(key).await
    }

    fn ensure_watching(&self, def: &TypeDefinition) -> bool {
        self.cache.ensure_watching(def)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.cache.subscribe_changes()
    }

    async fn begin_edit(
        &self,
        namespace: Option<&str>,
        kind: &str,
        name: &str,
        origin: Option<Classification>,
    ) -> MirraResult<EditHandle> {
        Ok(self.sessions.begin_edit(namespace, kind, name, origin).await?)
    }

    fn original_snapshot(&self, handle: &EditHandle) -> Json {
        handle.original_snapshot()
    }

    fn has_pending_changes(&self, handle: &EditHandle, proposed: &Json) -> bool {
        handle.has_pending_changes(proposed)
    }

    fn diff(&self, handle: &EditHandle, proposed: &Json) -> DiffSummary {
        mirra_apply::diff_summary(proposed, &handle.original_snapshot())
    }

    async fn refresh(&self, handle: &EditHandle) -> MirraResult<()> {
        Ok(self.sessions.refresh(handle).await?)
    }

    async fn validate_and_apply(
        &self,
        handle: &EditHandle,
        proposed: &Json,
        opts: ApplyOptions,
    ) -> MirraResult<ApplyReport> {
        Ok(self.coordinator.apply(&self.sessions, handle, proposed, opts).await?)
    }

    fn close_view(&self, handle: &EditHandle) {
        self.sessions.close_view(handle);
    }

    fn close_edit(&self, handle: &EditHandle, unsaved: bool) {
        self.sessions.close_edit(handle, unsaved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirra_cluster::mock::MockCluster;
    use mirra_core::WatchEvent;
    use std::time::Duration;

    fn widget_def() -> TypeDefinition {
        TypeDefinition {
            group: "widgets.fabric.dev".into(),
            version: "v1".into(),
            kind: "Widget".into(),
            plural: "widgets".into(),
            namespaced: true,
            served_version: "v1".into(),
        }
    }

    fn widget_raw(name: &str, token: &str) -> Json {
        serde_json::json!({
            "apiVersion": "widgets.fabric.dev/v1",
            "kind": "Widget",
            "metadata": {
                "name": name,
                "namespace": "ns",
                "uid": "00000000-0000-0000-0000-000000000009",
                "resourceVersion": token,
            },
            "spec": { "size": 1 }
        })
    }

    async fn settle(mut cond: impl FnMut() -> bool) {
        for _ in 0..4000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_discover_watch_edit_apply() {
        let cluster = Arc::new(MockCluster::new());
        let def = widget_def();
        cluster.add_type(def.clone());
        cluster.script_type_watch(vec![Ok(WatchEvent::Listed(vec![def.clone()]))]);
        cluster.script_instance_watch(
            &def.key(),
            vec![Ok(WatchEvent::Listed(vec![
                mirra_core::ResourceInstance::from_raw(widget_raw("w1", "41")).unwrap(),
            ]))],
        );
        cluster.put_object(widget_raw("w1", "41"));

        let mirra = Mirra::new(cluster.clone());
        mirra.start();

        // Catalog fans the type out; the cache converges on the listed
        // instance and announces the change.
        let mut changes = mirra.subscribe_changes();
        settle(|| mirra.cached_instances(&def.key(), None).len() == 1).await;
        assert!(mirra.wait_ready(&def.key()).await);
        changes.recv().await.unwrap();

        // Edit and apply through the façade. The heuristic classifies the
        // fabric.dev group as declarative.
        let handle = mirra.begin_edit(Some("ns"), "Widget", "w1", None).await.unwrap();
        let mut proposed = mirra.original_snapshot(&handle);
        proposed["spec"]["size"] = serde_json::json!(5);
        assert!(mirra.has_pending_changes(&handle, &proposed));
        assert_eq!(mirra.diff(&handle, &proposed).updates, 1);

        let report = mirra
            .validate_and_apply(&handle, &proposed, ApplyOptions::default())
            .await
            .unwrap();
        assert!(report.applied);
        assert!(report.transaction_id.is_some());
        assert!(!mirra.has_pending_changes(&handle, &proposed));

        mirra.close_edit(&handle, false);
        mirra.shutdown();
    }

    #[tokio::test]
    async fn facade_surfaces_validation_errors() {
        let cluster = Arc::new(MockCluster::new());
        cluster.put_object(widget_raw("w1", "41"));
        let mirra = Mirra::new(cluster);

        let handle = mirra.begin_edit(Some("ns"), "Widget", "w1", None).await.unwrap();
        let mut proposed = mirra.original_snapshot(&handle);
        proposed["kind"] = serde_json::json!("Gadget");
        let err = mirra
            .validate_and_apply(&handle, &proposed, ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MirraError::Validation(_)));
    }
}
