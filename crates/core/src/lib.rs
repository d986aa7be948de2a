//! mirra core types: identities, type/namespace records, watch events.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod canon;

/// Stable unique identity of one object instance, distinct from its name.
pub type Uid = [u8; 16];

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid type key: {0} (expect v1/plural or group/v1/plural)")]
    Key(String),
    #[error("invalid uid: {0}")]
    Uid(String),
    #[error("object missing {0}")]
    MissingField(&'static str),
}

/// Parse the remote system's uuid-formatted id into a compact [`Uid`].
pub fn parse_uid(uid_str: &str) -> Result<Uid, CoreError> {
    let u = uuid::Uuid::parse_str(uid_str).map_err(|e| CoreError::Uid(e.to_string()))?;
    Ok(*u.as_bytes())
}

/// Bucket key for one watched resource type: group + version + plural name.
/// The core group renders without the leading segment (`v1/widgets`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TypeKey {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl TypeKey {
    pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), plural: plural.into() }
    }

    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, plural] => Ok(Self::new("", *version, *plural)),
            [group, version, plural] => Ok(Self::new(*group, *version, *plural)),
            _ => Err(CoreError::Key(key.to_string())),
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// A served resource type discovered from the type catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeDefinition {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    pub served_version: String,
}

impl TypeDefinition {
    pub fn key(&self) -> TypeKey {
        TypeKey::new(self.group.clone(), self.version.clone(), self.plural.clone())
    }

    /// Catalog identity: one definition per (group, kind).
    pub fn catalog_key(&self) -> (String, String) {
        (self.group.clone(), self.kind.clone())
    }
}

/// A namespace known to the cluster. Lifecycle is watch-driven only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub name: String,
}

/// One mirrored object instance. `uid` is the invariant key across
/// add/update/delete; `version_token` backs optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub uid: Uid,
    pub name: String,
    pub namespace: Option<String>,
    pub version_token: String,
    pub kind: String,
    pub creation_ts: i64,
    pub labels: SmallVec<[(String, String); 8]>,
    pub raw: serde_json::Value,
}

impl ResourceInstance {
    /// Shape an instance from the raw object payload.
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, CoreError> {
        let meta = raw.get("metadata").ok_or(CoreError::MissingField("metadata"))?;
        let uid_str = meta
            .get("uid")
            .and_then(|v| v.as_str())
            .ok_or(CoreError::MissingField("metadata.uid"))?;
        let uid = parse_uid(uid_str)?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or(CoreError::MissingField("metadata.name"))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let version_token = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let kind = raw.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels = SmallVec::new();
        if let Some(lbls) = meta.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() {
                    labels.push((k.clone(), val.to_string()));
                }
            }
        }
        Ok(Self { uid, name, namespace, version_token, kind, creation_ts, labels, raw })
    }
}

/// One event on a long-lived subscription. `Listed` carries a full
/// authoritative snapshot: the initial list and every post-reconnect relist.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Updated(T),
    Deleted(T),
    Listed(Vec<T>),
}

/// How an object is submitted: through the declarative automation backend
/// or as an ordinary direct replace. Resolved once per object, not
/// re-inspected throughout the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Classification {
    Declarative,
    Raw,
}

/// One operation inside a declarative transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum TxOp {
    Create { value: serde_json::Value },
    Replace { value: serde_json::Value },
    Delete { uid: String },
}

/// The unit submitted to the declarative backend path. Accepted
/// asynchronously; the backend answers with a transaction id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclarativeTransaction {
    pub operations: Vec<TxOp>,
    pub dry_run: bool,
    pub description: String,
    pub retain: bool,
}

pub mod prelude {
    pub use super::{
        Classification, CoreError, DeclarativeTransaction, NamespaceRecord, ResourceInstance,
        TxOp, TypeDefinition, TypeKey, Uid, WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_key_parse_and_render() {
        let core = TypeKey::parse("v1/configmaps").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.to_string(), "v1/configmaps");

        let grouped = TypeKey::parse("widgets.fabric.dev/v1/widgets").unwrap();
        assert_eq!(grouped.group, "widgets.fabric.dev");
        assert_eq!(grouped.to_string(), "widgets.fabric.dev/v1/widgets");

        assert!(TypeKey::parse("justplural").is_err());
    }

    #[test]
    fn instance_from_raw_extracts_identity_and_token() {
        let raw = serde_json::json!({
            "apiVersion": "widgets.fabric.dev/v1",
            "kind": "Widget",
            "metadata": {
                "name": "w1",
                "namespace": "ns",
                "uid": "00000000-0000-0000-0000-000000000001",
                "resourceVersion": "12",
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "labels": { "app": "demo" }
            }
        });
        let inst = ResourceInstance::from_raw(raw).unwrap();
        assert_eq!(inst.name, "w1");
        assert_eq!(inst.namespace.as_deref(), Some("ns"));
        assert_eq!(inst.version_token, "12");
        assert_eq!(inst.kind, "Widget");
        assert_eq!(inst.labels.as_slice(), [("app".to_string(), "demo".to_string())]);
    }

    #[test]
    fn instance_from_raw_requires_uid() {
        let raw = serde_json::json!({ "kind": "Widget", "metadata": { "name": "w1" } });
        assert!(matches!(
            ResourceInstance::from_raw(raw),
            Err(CoreError::MissingField("metadata.uid"))
        ));
    }
}
