//! mirra apply coordinator: validate, diff, classify, submit.
//!
//! Every apply runs the same gauntlet: structural validation against the
//! session's snapshot, a canonical-form diff (byte-identical means a
//! friendly no-op, not an error), one-time classification, then one of two
//! submission paths — a direct versioned replace or a queued declarative
//! transaction. A failed apply never touches the snapshot, so the session
//! stays consistent and retryable.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::info;

use mirra_cluster::{declarative_group_suffix, split_api_version, ClusterApi, ClusterError};
use mirra_core::canon::{canonical_yaml, set_version_token, strip_server_managed, version_token};
use mirra_core::{Classification, DeclarativeTransaction, TxOp};
use mirra_session::{EditHandle, SessionRegistry};

fn max_yaml_bytes() -> usize {
    std::env::var("MIRRA_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("MIRRA_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Local, pre-network. Names the offending field.
    #[error("validation: {field}: {reason}")]
    Validation { field: String, reason: String },
    /// Version token mismatch on the raw path. Surfaced verbatim, never
    /// auto-resolved.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl From<ClusterError> for ApplyError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Conflict(msg) => ApplyError::Conflict(msg),
            ClusterError::NotFound(msg) => ApplyError::Backend(format!("not found: {msg}")),
            ClusterError::Api(msg) => ApplyError::Backend(msg),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ApplyError {
    ApplyError::Validation { field: field.to_string(), reason: reason.into() }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub dry_run: bool,
    pub applied: bool,
    /// Proposed content was canonically identical to the snapshot; the
    /// backend was never contacted.
    pub no_changes: bool,
    pub new_version: Option<String>,
    /// Id of the accepted transaction on the declarative path.
    pub transaction_id: Option<String>,
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub dry_run: bool,
}

fn str_field<'a>(v: &'a Json, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(|x| x.as_str())
}

/// Structural validation against the original snapshot. All rules run before
/// any network call.
pub fn validate(proposed: &Json, original: &Json, is_new: bool) -> Result<(), ApplyError> {
    if !proposed.is_object() {
        return Err(invalid("document", "proposed object must be a mapping"));
    }
    let kind = str_field(proposed, "/kind").unwrap_or("");
    if kind.is_empty() {
        return Err(invalid("kind", "must be present and non-empty"));
    }
    if str_field(proposed, "/apiVersion").unwrap_or("").is_empty() {
        return Err(invalid("apiVersion", "must be present and non-empty"));
    }
    let name = str_field(proposed, "/metadata/name").unwrap_or("");
    if name.is_empty() {
        return Err(invalid("metadata.name", "must be present and non-empty"));
    }

    let original_kind = str_field(original, "/kind").unwrap_or("");
    if !original_kind.is_empty() && kind != original_kind {
        return Err(invalid(
            "kind",
            format!("kind is immutable: expected {original_kind}, got {kind}"),
        ));
    }

    if !is_new {
        let original_name = str_field(original, "/metadata/name").unwrap_or("");
        if name != original_name {
            return Err(invalid(
                "metadata.name",
                format!("name is immutable: expected {original_name}, got {name}"),
            ));
        }
        if let Some(original_ns) = str_field(original, "/metadata/namespace") {
            let ns = str_field(proposed, "/metadata/namespace").unwrap_or("");
            if ns != original_ns {
                return Err(invalid(
                    "metadata.namespace",
                    format!("namespace is immutable: expected {original_ns}, got {ns}"),
                ));
            }
        }
    }
    Ok(())
}

/// Resolve the submission path once: explicit origin, then the origin
/// remembered for the triple, then the API-group-suffix heuristic. The
/// fallback chain exists because the origin signal is not available at every
/// entry point.
pub fn classify(
    explicit: Option<Classification>,
    stored: Option<Classification>,
    proposed: &Json,
) -> Classification {
    if let Some(c) = explicit {
        return c;
    }
    if let Some(c) = stored {
        return c;
    }
    let group = str_field(proposed, "/apiVersion")
        .map(|av| split_api_version(av).0)
        .unwrap_or_default();
    let suffix = declarative_group_suffix();
    if group == suffix || group.ends_with(&format!(".{suffix}")) {
        Classification::Declarative
    } else {
        Classification::Raw
    }
}

/// Structural diff between the proposed document and its base.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv {
                            continue;
                        }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) {
                        *rems += 1;
                    }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] {
                        *ups += 1;
                    }
                }
                if aa.len() > bb.len() {
                    *adds += aa.len() - bb.len();
                }
                if bb.len() > aa.len() {
                    *rems += bb.len() - aa.len();
                }
            }
            (av, bv) => {
                if av != bv {
                    *ups += 1;
                }
            }
        }
    }
    let mut adds = 0usize;
    let mut ups = 0usize;
    let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// Coordinates the full apply pipeline over one edit session.
pub struct ApplyCoordinator {
    cluster: Arc<dyn ClusterApi>,
}

impl ApplyCoordinator {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Validate and submit a proposed object for a session. On non-dry
    /// success the session snapshot advances to the applied object and a
    /// created object stops being new.
    pub async fn apply(
        &self,
        registry: &SessionRegistry,
        handle: &EditHandle,
        proposed: &Json,
        opts: ApplyOptions,
    ) -> Result<ApplyReport, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);

        let original = handle.original_snapshot();
        let is_new = handle.is_new();

        let approx_len = proposed.to_string().len();
        if approx_len > max_yaml_bytes() {
            return Err(invalid("document", format!("payload too large (>{} bytes)", max_yaml_bytes())));
        }
        if node_budget_exceeded(proposed, max_yaml_nodes()) {
            return Err(invalid("document", format!("payload too complex (>{} nodes)", max_yaml_nodes())));
        }
        validate(proposed, &original, is_new)?;

        let mut clean = proposed.clone();
        strip_server_managed(&mut clean);

        let before = canonical_yaml(&original).map_err(|e| ApplyError::Backend(e.to_string()))?;
        let after = canonical_yaml(&clean).map_err(|e| ApplyError::Backend(e.to_string()))?;
        if before == after {
            // Intentional idempotence: clean content is an informational
            // outcome, not an error, and the backend is never contacted.
            counter!("apply_noop", 1u64);
            return Ok(ApplyReport { dry_run: opts.dry_run, no_changes: true, ..Default::default() });
        }
        let summary = diff_summary(&clean, &original);

        let classification = classify(handle.origin(), registry.stored_origin(handle.triple()), &clean);
        info!(
            session = %handle.id(),
            triple = %handle.triple(),
            ?classification,
            dry_run = opts.dry_run,
            is_new,
            "apply start"
        );

        let report = match classification {
            Classification::Raw => self.apply_raw(registry, handle, clean, is_new, opts, summary).await,
            Classification::Declarative => {
                self.apply_declarative(registry, handle, clean, is_new, opts, summary).await
            }
        };

        match &report {
            Ok(r) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                info!(
                    session = %handle.id(),
                    applied = r.applied,
                    tx = r.transaction_id.as_deref().unwrap_or("-"),
                    "apply done"
                );
            }
            Err(ApplyError::Conflict(_)) => {
                counter!("apply_conflict", 1u64);
            }
            Err(_) => {
                counter!("apply_err", 1u64);
            }
        }
        report
    }

    async fn apply_raw(
        &self,
        registry: &SessionRegistry,
        handle: &EditHandle,
        mut clean: Json,
        is_new: bool,
        opts: ApplyOptions,
        summary: DiffSummary,
    ) -> Result<ApplyReport, ApplyError> {
        let applied = if is_new {
            self.cluster.create_object(&clean, opts.dry_run).await?
        } else {
            // The snapshot's token rides along; a mismatch comes back as a
            // conflict and is surfaced as-is.
            let token = version_token(&handle.original_snapshot()).unwrap_or("").to_string();
            set_version_token(&mut clean, &token);
            self.cluster.replace_object(&clean, opts.dry_run).await?
        };
        let new_version = version_token(&applied).map(|s| s.to_string());
        if !opts.dry_run {
            registry.complete_apply(handle, applied);
        }
        Ok(ApplyReport {
            dry_run: opts.dry_run,
            applied: !opts.dry_run,
            no_changes: false,
            new_version,
            transaction_id: None,
            summary,
        })
    }

    async fn apply_declarative(
        &self,
        registry: &SessionRegistry,
        handle: &EditHandle,
        clean: Json,
        is_new: bool,
        opts: ApplyOptions,
        summary: DiffSummary,
    ) -> Result<ApplyReport, ApplyError> {
        let op = if is_new {
            TxOp::Create { value: clean.clone() }
        } else {
            TxOp::Replace { value: clean.clone() }
        };
        let tx = DeclarativeTransaction {
            operations: vec![op],
            dry_run: opts.dry_run,
            description: format!("apply {}", handle.triple()),
            retain: false,
        };
        let id = self.cluster.submit_transaction(&tx).await?;
        info!(tx = %id, triple = %handle.triple(), "transaction queued");
        if !opts.dry_run {
            // The backend acknowledged the change; the accepted content is
            // the best available next snapshot.
            registry.complete_apply(handle, clean);
        }
        Ok(ApplyReport {
            dry_run: opts.dry_run,
            applied: !opts.dry_run,
            no_changes: false,
            new_version: None,
            transaction_id: Some(id),
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirra_cluster::mock::MockCluster;
    use std::sync::atomic::Ordering;

    fn widget(name: &str, size: u64, token: &str) -> Json {
        serde_json::json!({
            "apiVersion": "widgets.fabric.dev/v1",
            "kind": "Widget",
            "metadata": {
                "name": name,
                "namespace": "ns",
                "uid": "00000000-0000-0000-0000-000000000001",
                "resourceVersion": token,
            },
            "spec": { "size": size }
        })
    }

    fn plain(name: &str, size: u64, token: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "ns",
                          "uid": "00000000-0000-0000-0000-000000000002",
                          "resourceVersion": token },
            "data": { "size": size.to_string() }
        })
    }

    async fn setup(seed: Json) -> (Arc<MockCluster>, SessionRegistry, ApplyCoordinator) {
        let cluster = Arc::new(MockCluster::new());
        cluster.put_object(seed);
        let registry = SessionRegistry::new(cluster.clone());
        let coordinator = ApplyCoordinator::new(cluster.clone());
        (cluster, registry, coordinator)
    }

    #[test]
    fn classify_prefers_explicit_then_stored_then_heuristic() {
        let declarative = widget("w", 1, "1");
        let raw = plain("c", 1, "1");

        assert_eq!(classify(None, None, &declarative), Classification::Declarative);
        assert_eq!(classify(None, None, &raw), Classification::Raw);
        assert_eq!(
            classify(None, Some(Classification::Declarative), &raw),
            Classification::Declarative
        );
        assert_eq!(
            classify(Some(Classification::Raw), Some(Classification::Declarative), &declarative),
            Classification::Raw
        );
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s.adds, 2);
        assert_eq!(s.updates, 2);
        assert_eq!(s.removes, 1);
    }

    #[test]
    fn node_budget_walk_bails_early() {
        let v = serde_json::json!({ "a": [1, 2, 3], "b": { "c": 4 } });
        assert!(node_budget_exceeded(&v, 3));
        assert!(!node_budget_exceeded(&v, 100));
    }

    #[tokio::test]
    async fn kind_change_is_rejected_before_any_network_call() {
        let (cluster, registry, coordinator) = setup(plain("c1", 1, "41")).await;
        let handle = registry.begin_edit(Some("ns"), "ConfigMap", "c1", None).await.unwrap();

        let mut proposed = handle.original_snapshot();
        proposed["kind"] = serde_json::json!("Gadget");
        let err = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Validation { ref field, .. } if field == "kind"));
        assert_eq!(cluster.replace_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rename_of_existing_object_is_rejected() {
        let (cluster, registry, coordinator) = setup(plain("c1", 1, "41")).await;
        let handle = registry.begin_edit(Some("ns"), "ConfigMap", "c1", None).await.unwrap();

        let mut proposed = handle.original_snapshot();
        proposed["metadata"]["name"] = serde_json::json!("other");
        let err = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Validation { ref field, .. } if field == "metadata.name"));

        let mut moved = handle.original_snapshot();
        moved["metadata"]["namespace"] = serde_json::json!("elsewhere");
        let err = coordinator
            .apply(&registry, &handle, &moved, ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, ApplyError::Validation { ref field, .. } if field == "metadata.namespace")
        );
        assert_eq!(cluster.replace_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn identical_content_short_circuits_without_backend() {
        let (cluster, registry, coordinator) = setup(plain("c1", 1, "41")).await;
        let handle = registry.begin_edit(Some("ns"), "ConfigMap", "c1", None).await.unwrap();

        let proposed = handle.original_snapshot();
        let report = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions::default())
            .await
            .unwrap();
        assert!(report.no_changes);
        assert!(!report.applied);
        assert_eq!(cluster.replace_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.transaction_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn raw_apply_advances_snapshot_and_token() {
        let (cluster, registry, coordinator) = setup(plain("c1", 1, "41")).await;
        let handle = registry.begin_edit(Some("ns"), "ConfigMap", "c1", None).await.unwrap();

        let mut proposed = handle.original_snapshot();
        proposed["data"]["size"] = serde_json::json!("5");
        let report = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions::default())
            .await
            .unwrap();
        assert!(report.applied);
        assert_eq!(report.new_version.as_deref(), Some("42"));
        assert_eq!(report.summary.updates, 1);
        assert_eq!(cluster.replace_calls.load(Ordering::SeqCst), 1);

        // The session snapshot advanced, so the same content is now a no-op.
        let snap = handle.original_snapshot();
        assert_eq!(mirra_core::canon::version_token(&snap), Some("42"));
    }

    #[tokio::test]
    async fn dry_run_leaves_session_and_backend_untouched() {
        let (cluster, registry, coordinator) = setup(plain("c1", 1, "41")).await;
        let handle = registry.begin_edit(Some("ns"), "ConfigMap", "c1", None).await.unwrap();

        let mut proposed = handle.original_snapshot();
        proposed["data"]["size"] = serde_json::json!("9");
        let report = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions { dry_run: true })
            .await
            .unwrap();
        assert!(report.dry_run);
        assert!(!report.applied);

        assert_eq!(mirra_core::canon::version_token(&handle.original_snapshot()), Some("41"));
        let live = cluster.object(Some("ns"), "ConfigMap", "c1").unwrap();
        assert_eq!(live.pointer("/data/size").unwrap(), "1");
    }

    #[tokio::test]
    async fn conflict_is_surfaced_and_snapshot_unchanged() {
        let (cluster, registry, coordinator) = setup(plain("c1", 1, "41")).await;
        let handle = registry.begin_edit(Some("ns"), "ConfigMap", "c1", None).await.unwrap();

        // Concurrent writer moves the live object to token 42.
        let mut newer = cluster.object(Some("ns"), "ConfigMap", "c1").unwrap();
        newer["data"]["size"] = serde_json::json!("2");
        mirra_core::canon::set_version_token(&mut newer, "42");
        cluster.put_object(newer);

        let mut proposed = handle.original_snapshot();
        proposed["data"]["size"] = serde_json::json!("3");
        let err = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Conflict(_)));

        // Failed applies never move the snapshot.
        assert_eq!(mirra_core::canon::version_token(&handle.original_snapshot()), Some("41"));
    }

    #[tokio::test]
    async fn declarative_create_queues_transaction_and_clears_is_new() {
        let cluster = Arc::new(MockCluster::new());
        let registry = SessionRegistry::new(cluster.clone());
        let coordinator = ApplyCoordinator::new(cluster.clone());

        let handle = registry
            .begin_edit(Some("ns"), "Widget", "fresh", Some(Classification::Declarative))
            .await
            .unwrap();
        assert!(handle.is_new());

        let proposed = widget("fresh", 2, "");
        let report = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(cluster.transaction_calls.load(Ordering::SeqCst), 1);
        assert!(report.transaction_id.is_some());
        assert!(!handle.is_new());

        let submitted = cluster.submitted_transactions();
        assert_eq!(submitted.len(), 1);
        assert!(matches!(submitted[0].operations[0], TxOp::Create { .. }));
        assert!(!submitted[0].retain);

        // The object exists now; the next apply must replace, not create.
        let mut next = handle.original_snapshot();
        next["spec"]["size"] = serde_json::json!(4);
        coordinator
            .apply(&registry, &handle, &next, ApplyOptions::default())
            .await
            .unwrap();
        let submitted = cluster.submitted_transactions();
        assert!(matches!(submitted[1].operations[0], TxOp::Replace { .. }));
        assert_eq!(cluster.replace_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn declarative_dry_run_is_marked_on_the_transaction() {
        let (cluster, registry, coordinator) = setup(widget("w1", 1, "41")).await;
        let handle = registry.begin_edit(Some("ns"), "Widget", "w1", None).await.unwrap();

        let mut proposed = handle.original_snapshot();
        proposed["spec"]["size"] = serde_json::json!(8);
        let report = coordinator
            .apply(&registry, &handle, &proposed, ApplyOptions { dry_run: true })
            .await
            .unwrap();
        assert!(report.dry_run);
        let submitted = cluster.submitted_transactions();
        assert!(submitted[0].dry_run);
        // Dry runs never advance the snapshot.
        assert_eq!(mirra_core::canon::version_token(&handle.original_snapshot()), Some("41"));
    }
}
