//! Scriptable in-memory [`ClusterApi`] used by tests across the workspace.
//!
//! Watches are driven by pre-loaded scripts: each call to a `watch_*` method
//! consumes the next script for that source, sends its items, then keeps the
//! subscription open (unless the script ended with an error, which ends the
//! subscription the way a real stream failure would). Mutation endpoints
//! count their invocations so tests can assert that a code path never
//! reached the backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value as Json;
use tokio::sync::mpsc;

use mirra_core::{
    DeclarativeTransaction, NamespaceRecord, ResourceInstance, TypeDefinition, TypeKey, WatchEvent,
};

use crate::{object_target, CancelHandle, ClusterApi, ClusterError, Subscription};

pub type Script<T> = Vec<Result<WatchEvent<T>, ClusterError>>;

/// (namespace, kind, name)
type ObjectKey = (Option<String>, String, String);

#[derive(Default)]
struct MockState {
    types: Vec<TypeDefinition>,
    namespaces: Vec<NamespaceRecord>,
    objects: HashMap<ObjectKey, Json>,
    type_scripts: VecDeque<Script<TypeDefinition>>,
    namespace_scripts: VecDeque<Script<NamespaceRecord>>,
    instance_scripts: HashMap<String, VecDeque<Script<ResourceInstance>>>,
    submitted: Vec<DeclarativeTransaction>,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
    pub replace_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub transaction_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&self, def: TypeDefinition) {
        self.state.lock().unwrap().types.push(def);
    }

    /// Seed an object; it becomes visible to `get_object` and the mutation
    /// endpoints. A missing `resourceVersion` is assigned.
    pub fn put_object(&self, mut object: Json) {
        let target = object_target(&object).expect("seed object must carry a target");
        if mirra_core::canon::version_token(&object).is_none() {
            mirra_core::canon::set_version_token(&mut object, "1");
        }
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((target.namespace, target.kind, target.name), object);
    }

    pub fn object(&self, namespace: Option<&str>, kind: &str, name: &str) -> Option<Json> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(namespace.map(|s| s.to_string()), kind.to_string(), name.to_string()))
            .cloned()
    }

    pub fn script_type_watch(&self, script: Script<TypeDefinition>) {
        self.state.lock().unwrap().type_scripts.push_back(script);
    }

    pub fn script_namespace_watch(&self, script: Script<NamespaceRecord>) {
        self.state.lock().unwrap().namespace_scripts.push_back(script);
    }

    pub fn script_instance_watch(&self, key: &TypeKey, script: Script<ResourceInstance>) {
        self.state
            .lock()
            .unwrap()
            .instance_scripts
            .entry(key.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn submitted_transactions(&self) -> Vec<DeclarativeTransaction> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn play<T: Send + 'static>(script: Script<T>) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            for item in script {
                let terminal = item.is_err();
                if tx.send(item).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }
            // Stay open like a healthy long-lived stream.
            futures::future::pending::<()>().await;
        });
        Subscription { rx, cancel: CancelHandle::new(task) }
    }

    fn next_token(current: &str) -> String {
        (current.parse::<u64>().unwrap_or(0) + 1).to_string()
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockCluster {
    async fn list_types(&self) -> Result<Vec<TypeDefinition>, ClusterError> {
        Ok(self.state.lock().unwrap().types.clone())
    }

    async fn watch_types(&self) -> Result<Subscription<TypeDefinition>, ClusterError> {
        let script = self
            .state
            .lock()
            .unwrap()
            .type_scripts
            .pop_front()
            .unwrap_or_default();
        Ok(Self::play(script))
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>, ClusterError> {
        Ok(self.state.lock().unwrap().namespaces.clone())
    }

    async fn watch_namespaces(&self) -> Result<Subscription<NamespaceRecord>, ClusterError> {
        let script = self
            .state
            .lock()
            .unwrap()
            .namespace_scripts
            .pop_front()
            .unwrap_or_default();
        Ok(Self::play(script))
    }

    async fn watch_instances(
        &self,
        def: &TypeDefinition,
    ) -> Result<Subscription<ResourceInstance>, ClusterError> {
        let script = self
            .state
            .lock()
            .unwrap()
            .instance_scripts
            .get_mut(&def.key().to_string())
            .and_then(|q| q.pop_front())
            .unwrap_or_default();
        Ok(Self::play(script))
    }

    async fn get_object(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Json, ClusterError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.object(namespace, kind, name)
            .ok_or_else(|| ClusterError::NotFound(format!("{kind}/{name}")))
    }

    async fn replace_object(&self, object: &Json, dry_run: bool) -> Result<Json, ClusterError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let target = object_target(object)?;
        let mut state = self.state.lock().unwrap();
        let key: ObjectKey = (target.namespace.clone(), target.kind.clone(), target.name.clone());
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("{}/{}", target.kind, target.name)))?;
        let current = mirra_core::canon::version_token(stored).unwrap_or("").to_string();
        let submitted = mirra_core::canon::version_token(object).unwrap_or("").to_string();
        if submitted.is_empty() || submitted != current {
            return Err(ClusterError::Conflict(format!(
                "version token mismatch: current {current}, submitted {submitted}"
            )));
        }
        let mut updated = object.clone();
        if !dry_run {
            let token = Self::next_token(&current);
            mirra_core::canon::set_version_token(&mut updated, &token);
            state.objects.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn create_object(&self, object: &Json, dry_run: bool) -> Result<Json, ClusterError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let target = object_target(object)?;
        let mut state = self.state.lock().unwrap();
        let key: ObjectKey = (target.namespace.clone(), target.kind.clone(), target.name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClusterError::Conflict(format!(
                "already exists: {}/{}",
                target.kind, target.name
            )));
        }
        let mut created = object.clone();
        if let Some(meta) = created.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.entry("uid".to_string())
                .or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
        }
        if !dry_run {
            mirra_core::canon::set_version_token(&mut created, "1");
            state.objects.insert(key, created.clone());
        }
        Ok(created)
    }

    async fn submit_transaction(&self, tx: &DeclarativeTransaction) -> Result<String, ClusterError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.submitted.push(tx.clone());
        Ok(format!("tx-{:04}", state.submitted.len()))
    }
}
