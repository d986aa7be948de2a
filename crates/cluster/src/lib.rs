//! mirra cluster boundary: the one seam to the remote resource API.
//!
//! Everything above this crate (cache, sessions, apply) talks to the cluster
//! through [`ClusterApi`]. The kube-backed implementation lives in
//! [`client`]; [`mock`] holds a scriptable in-memory implementation used by
//! downstream tests.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use mirra_core::{DeclarativeTransaction, NamespaceRecord, ResourceInstance, TypeDefinition, WatchEvent};

pub mod client;
pub mod mock;

pub use client::KubeCluster;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Version token mismatch on a direct replace. Never retried here.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("api: {0}")]
    Api(String),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message.clone()),
            _ => ClusterError::Api(e.to_string()),
        }
    }
}

/// Handle for one long-lived subscription. Items arrive over an explicit
/// queue; an `Err` item terminates the subscription and the caller is
/// responsible for re-establishing it. The channel closing means the stream
/// ended without a reportable error.
pub struct Subscription<T> {
    pub rx: mpsc::Receiver<Result<WatchEvent<T>, ClusterError>>,
    pub cancel: CancelHandle,
}

impl<T> Subscription<T> {
    pub async fn next(&mut self) -> Option<Result<WatchEvent<T>, ClusterError>> {
        self.rx.recv().await
    }
}

/// Aborts the producing task when explicitly cancelled. Producers also exit
/// on their own once the receiving side is dropped.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Handle for subscriptions that have no producing task to stop.
    pub fn detached() -> Self {
        Self { task: None }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Queue capacity between a subscription producer and its consumer.
pub fn queue_cap() -> usize {
    std::env::var("MIRRA_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
}

/// API group suffix marking the declarative automation domain.
pub fn declarative_group_suffix() -> String {
    std::env::var("MIRRA_DECLARATIVE_SUFFIX").unwrap_or_else(|_| "fabric.dev".to_string())
}

/// Remote resource API as consumed by the rest of the system. Each `watch_*`
/// returns an initial authoritative list as the first `Listed` event,
/// followed by incremental add/update/delete events.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_types(&self) -> Result<Vec<TypeDefinition>, ClusterError>;
    async fn watch_types(&self) -> Result<Subscription<TypeDefinition>, ClusterError>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>, ClusterError>;
    async fn watch_namespaces(&self) -> Result<Subscription<NamespaceRecord>, ClusterError>;

    async fn watch_instances(
        &self,
        def: &TypeDefinition,
    ) -> Result<Subscription<ResourceInstance>, ClusterError>;

    /// On-demand fresh fetch, bypassing any cache. Used when entering edit
    /// mode.
    async fn get_object(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Json, ClusterError>;

    /// Direct replace of one object. The payload's version token is the
    /// optimistic-concurrency check; a mismatch comes back as
    /// [`ClusterError::Conflict`].
    async fn replace_object(&self, object: &Json, dry_run: bool) -> Result<Json, ClusterError>;

    async fn create_object(&self, object: &Json, dry_run: bool) -> Result<Json, ClusterError>;

    /// Queue a declarative transaction; returns the accepted transaction id.
    /// Completion tracking is not this system's concern.
    async fn submit_transaction(&self, tx: &DeclarativeTransaction) -> Result<String, ClusterError>;
}

/// Split an `apiVersion` string into (group, version).
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Fully resolved submission target of an object payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTarget {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

/// Resolve the target of an object payload from its own fields.
pub fn object_target(object: &Json) -> Result<ObjectTarget, ClusterError> {
    let api_version = object
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClusterError::Api("object missing apiVersion".into()))?;
    let kind = object
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClusterError::Api("object missing kind".into()))?;
    let name = object
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClusterError::Api("object missing metadata.name".into()))?;
    let namespace = object
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let (group, version) = split_api_version(api_version);
    Ok(ObjectTarget {
        group,
        version,
        kind: kind.to_string(),
        name: name.to_string(),
        namespace,
    })
}
