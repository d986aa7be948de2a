#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use mirra_cache::{InstanceCacheManager, TypeCatalog};
use mirra_cluster::{mock::MockCluster, ClusterError};
use mirra_core::{ResourceInstance, TypeDefinition, TypeKey, WatchEvent};

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

fn native_def() -> TypeDefinition {
    TypeDefinition {
        group: "apiextensions.k8s.io".into(),
        version: "v1".into(),
        kind: "Machinery".into(),
        plural: "machineries".into(),
        namespaced: false,
        served_version: "v1".into(),
    }
}

fn inst(n: u8, name: &str, ns: &str, token: &str) -> ResourceInstance {
    let raw = serde_json::json!({
        "apiVersion": "widgets.fabric.dev/v1",
        "kind": "Widget",
        "metadata": {
            "name": name,
            "namespace": ns,
            "uid": format!("{:02x}000000-0000-0000-0000-000000000000", n),
            "resourceVersion": token,
        }
    });
    ResourceInstance::from_raw(raw).unwrap()
}

/// Drive paused time forward until the condition holds.
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
async fn bucket_replays_watch_stream() {
    let cluster = Arc::new(MockCluster::new());
    let key = widget_def().key();
    cluster.script_instance_watch(
        &key,
        vec![
            Ok(WatchEvent::Listed(vec![inst(1, "a", "ns", "1")])),
            Ok(WatchEvent::Updated(inst(1, "a", "ns", "2"))),
            Ok(WatchEvent::Added(inst(2, "b", "other", "1"))),
        ],
    );

    let manager = InstanceCacheManager::new(cluster);
    assert!(manager.instances(&key).is_empty());

    assert!(manager.ensure_watching(&widget_def()));
    assert!(manager.wait_ready(&key).await);

    settle(|| manager.instances(&key).len() == 2).await;
    let a = manager
        .instances(&key)
        .into_iter()
        .find(|o| o.name == "a")
        .unwrap();
    assert_eq!(a.version_token, "2");

    // Namespace-scoped reads are a filter over the cluster-wide bucket.
    let scoped = manager.instances_in(&key, "other");
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].name, "b");

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn ensure_watching_is_idempotent() {
    let cluster = Arc::new(MockCluster::new());
    let manager = InstanceCacheManager::new(cluster);

    assert!(manager.ensure_watching(&widget_def()));
    assert!(!manager.ensure_watching(&widget_def()));
    assert_eq!(manager.watched_keys().len(), 1);

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn reconnect_relist_is_authoritative() {
    let cluster = Arc::new(MockCluster::new());
    let key = widget_def().key();
    cluster.script_instance_watch(
        &key,
        vec![
            Ok(WatchEvent::Listed(vec![inst(1, "a", "ns", "1"), inst(2, "b", "ns", "1")])),
            Err(ClusterError::Api("stream failure".into())),
        ],
    );
    // The post-reconnect list omits identity 1; it must disappear.
    cluster.script_instance_watch(&key, vec![Ok(WatchEvent::Listed(vec![inst(2, "b", "ns", "7")]))]);

    let manager = InstanceCacheManager::new(cluster);
    manager.ensure_watching(&widget_def());

    settle(|| manager.instances(&key).len() == 2).await;
    settle(|| {
        let items = manager.instances(&key);
        items.len() == 1 && items[0].version_token == "7"
    })
    .await;

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn type_catalog_fans_out_and_keeps_watches_on_deletion() {
    let cluster = Arc::new(MockCluster::new());
    cluster.script_type_watch(vec![
        Ok(WatchEvent::Listed(vec![widget_def(), native_def()])),
        Ok(WatchEvent::Deleted(widget_def())),
    ]);

    let manager = Arc::new(InstanceCacheManager::new(cluster.clone()));
    let catalog = TypeCatalog::spawn(cluster, manager.clone());

    let widget_key = widget_def().key();
    let native_key: TypeKey = native_def().key();
    settle(|| manager.is_watching(&widget_key)).await;
    // Infrastructure-native groups are never fanned out.
    assert!(!manager.is_watching(&native_key));

    // The deletion drops the definition but deliberately leaves the
    // instance watch running.
    settle(|| catalog.definitions().iter().all(|d| d.kind != "Widget")).await;
    assert!(manager.is_watching(&widget_key));

    catalog.shutdown();
    manager.shutdown();
}
