//! Kube-backed [`ClusterApi`] implementation: discovery, watcher wiring, and
//! the two submission endpoints.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mirra_core::{DeclarativeTransaction, NamespaceRecord, ResourceInstance, TypeDefinition, WatchEvent};

use crate::{
    declarative_group_suffix, object_target, queue_cap, CancelHandle, ClusterApi, ClusterError,
    Subscription,
};

const FIELD_MANAGER: &str = "mirra";

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn find_api_resource(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, bool), ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(ClusterError::NotFound(format!(
            "type not served: {}/{}/{}",
            gvk.group, gvk.version, gvk.kind
        )))
    }

    async fn find_by_kind(&self, kind: &str) -> Result<(ApiResource, bool), ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.kind == kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(ClusterError::NotFound(format!("kind not served: {kind}")))
    }

    fn dynamic_api(&self, ar: &ApiResource, namespaced: bool, ns: Option<&str>) -> Result<Api<DynamicObject>, ClusterError> {
        if namespaced {
            match ns {
                Some(n) => Ok(Api::namespaced_with(self.client.clone(), n, ar)),
                None => Err(ClusterError::Api("namespace required for namespaced kind".into())),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), ar))
        }
    }
}

fn def_from_crd(crd: &CustomResourceDefinition) -> Option<TypeDefinition> {
    let spec = &crd.spec;
    let served = spec.versions.iter().find(|v| v.served)?;
    Some(TypeDefinition {
        group: spec.group.clone(),
        version: served.name.clone(),
        kind: spec.names.kind.clone(),
        plural: spec.names.plural.clone(),
        namespaced: spec.scope == "Namespaced",
        served_version: served.name.clone(),
    })
}

fn ns_record(ns: &Namespace) -> Option<NamespaceRecord> {
    ns.metadata.name.as_ref().map(|name| NamespaceRecord { name: name.clone() })
}

fn instance_from(obj: &DynamicObject, def: &TypeDefinition) -> Option<ResourceInstance> {
    let mut raw = match serde_json::to_value(obj) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "skipping unserializable object");
            return None;
        }
    };
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    // Watches over dynamic objects can omit type metadata; restore it from
    // the watched definition so downstream consumers always see it.
    if let Some(top) = raw.as_object_mut() {
        top.entry("kind").or_insert_with(|| Json::String(def.kind.clone()));
        let api_version = if def.group.is_empty() {
            def.version.clone()
        } else {
            format!("{}/{}", def.group, def.version)
        };
        top.entry("apiVersion").or_insert_with(|| Json::String(api_version));
    }
    match ResourceInstance::from_raw(raw) {
        Ok(inst) => Some(inst),
        Err(e) => {
            warn!(error = %e, "skipping malformed object");
            None
        }
    }
}

/// Spawn a producer forwarding watcher events into an explicit queue. The
/// kube watcher's init phases are buffered into one authoritative `Listed`
/// event; an error item ends the subscription (the supervisor reopens it).
fn spawn_watch<K, T, F>(api: Api<K>, label: String, map: F) -> Subscription<T>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
    T: Send + 'static,
    F: Fn(&K) -> Option<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(queue_cap());
    let task = tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        info!(watch = %label, "watch started");
        let mut relist: Option<Vec<T>> = None;
        while let Some(ev) = stream.next().await {
            let out = match ev {
                Ok(Event::Init) => {
                    relist = Some(Vec::new());
                    None
                }
                Ok(Event::InitApply(o)) => {
                    if let Some(buf) = relist.as_mut() {
                        if let Some(t) = map(&o) {
                            buf.push(t);
                        }
                    }
                    None
                }
                Ok(Event::InitDone) => relist.take().map(WatchEvent::Listed),
                Ok(Event::Apply(o)) => map(&o).map(WatchEvent::Updated),
                Ok(Event::Delete(o)) => map(&o).map(WatchEvent::Deleted),
                Err(e) => {
                    let _ = tx.send(Err(ClusterError::Api(e.to_string()))).await;
                    break;
                }
            };
            if let Some(evt) = out {
                if tx.send(Ok(evt)).await.is_err() {
                    break;
                }
            }
        }
        debug!(watch = %label, "watch stream ended");
    });
    Subscription { rx, cancel: CancelHandle::new(task) }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn list_types(&self) -> Result<Vec<TypeDefinition>, ClusterError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = api.list(&ListParams::default()).await?;
        let mut out: Vec<TypeDefinition> = crds.items.iter().filter_map(def_from_crd).collect();
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.kind.cmp(&b.kind)));
        Ok(out)
    }

    async fn watch_types(&self) -> Result<Subscription<TypeDefinition>, ClusterError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(spawn_watch(api, "types".into(), def_from_crd))
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().filter_map(ns_record).collect())
    }

    async fn watch_namespaces(&self) -> Result<Subscription<NamespaceRecord>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(spawn_watch(api, "namespaces".into(), ns_record))
    }

    async fn watch_instances(
        &self,
        def: &TypeDefinition,
    ) -> Result<Subscription<ResourceInstance>, ClusterError> {
        let gvk = GroupVersionKind {
            group: def.group.clone(),
            version: def.version.clone(),
            kind: def.kind.clone(),
        };
        let ar = ApiResource::from_gvk_with_plural(&gvk, &def.plural);
        // Instance watches are cluster-wide; namespace scoping happens at
        // read time over the bucket.
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let owned = def.clone();
        Ok(spawn_watch(api, def.key().to_string(), move |o| instance_from(o, &owned)))
    }

    async fn get_object(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Json, ClusterError> {
        let (ar, namespaced) = self.find_by_kind(kind).await?;
        let api = self.dynamic_api(&ar, namespaced, namespace)?;
        let obj = api.get(name).await?;
        serde_json::to_value(&obj).map_err(|e| ClusterError::Api(e.to_string()))
    }

    async fn replace_object(&self, object: &Json, dry_run: bool) -> Result<Json, ClusterError> {
        let target = object_target(object)?;
        let gvk = GroupVersionKind {
            group: target.group,
            version: target.version,
            kind: target.kind,
        };
        let (ar, namespaced) = self.find_api_resource(&gvk).await?;
        let api = self.dynamic_api(&ar, namespaced, target.namespace.as_deref())?;
        let data: DynamicObject =
            serde_json::from_value(object.clone()).map_err(|e| ClusterError::Api(e.to_string()))?;
        let pp = PostParams { dry_run, field_manager: Some(FIELD_MANAGER.into()) };
        let updated = api.replace(&target.name, &pp, &data).await?;
        serde_json::to_value(&updated).map_err(|e| ClusterError::Api(e.to_string()))
    }

    async fn create_object(&self, object: &Json, dry_run: bool) -> Result<Json, ClusterError> {
        let target = object_target(object)?;
        let gvk = GroupVersionKind {
            group: target.group,
            version: target.version,
            kind: target.kind,
        };
        let (ar, namespaced) = self.find_api_resource(&gvk).await?;
        let api = self.dynamic_api(&ar, namespaced, target.namespace.as_deref())?;
        let data: DynamicObject =
            serde_json::from_value(object.clone()).map_err(|e| ClusterError::Api(e.to_string()))?;
        let pp = PostParams { dry_run, field_manager: Some(FIELD_MANAGER.into()) };
        let created = api.create(&pp, &data).await?;
        serde_json::to_value(&created).map_err(|e| ClusterError::Api(e.to_string()))
    }

    async fn submit_transaction(&self, tx: &DeclarativeTransaction) -> Result<String, ClusterError> {
        let group = declarative_group_suffix();
        let gvk = GroupVersionKind {
            group: group.clone(),
            version: "v1alpha1".into(),
            kind: "Transaction".into(),
        };
        let ar = ApiResource::from_gvk_with_plural(&gvk, "transactions");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let body = serde_json::json!({
            "apiVersion": format!("{group}/v1alpha1"),
            "kind": "Transaction",
            "metadata": { "generateName": "tx-" },
            "spec": tx,
        });
        let data: DynamicObject =
            serde_json::from_value(body).map_err(|e| ClusterError::Api(e.to_string()))?;
        let created = api.create(&PostParams::default(), &data).await?;
        let id = created
            .metadata
            .name
            .or(created.metadata.uid)
            .unwrap_or_else(|| "unknown".into());
        info!(tx = %id, dry_run = tx.dry_run, "transaction accepted");
        Ok(id)
    }
}
