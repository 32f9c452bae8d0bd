//! Request routing: writes go to the leader, reads fall back to it.

mod common;

use std::time::Duration;

use patchlog_cluster::cluster::ClusterError;
use patchlog_cluster::types::{LogId, Patch};

use common::{TestCluster, wait_for};

fn patch(id: &str, previous: Option<&str>) -> Patch {
    Patch::new(id, previous.map(LogId::new), format!("payload-{}", id))
}

#[tokio::test]
async fn test_follower_append_is_forwarded_once() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    a.service.create_patch_log("orders").await.unwrap();
    b.service.reconcile_once().await.unwrap();

    let head = b
        .service
        .append("orders", patch("p1", None), Some(LogId::initial()))
        .await
        .unwrap();
    assert_eq!(head, LogId::new("p1"));

    assert_eq!(cluster.transport.call_count(a.url(), "append"), 1);
    assert_eq!(a.store.patches("orders").await.unwrap().len(), 1);
    assert!(b.store.patches("orders").await.unwrap().is_empty());

    let record = a
        .service
        .directory()
        .dataset_record("orders")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.head, LogId::new("p1"));
}

#[tokio::test]
async fn test_retried_forwarded_append_is_applied_once() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    a.service.create_patch_log("orders").await.unwrap();
    b.service.reconcile_once().await.unwrap();

    let head = b
        .service
        .append("orders", patch("p1", None), Some(LogId::initial()))
        .await
        .unwrap();
    assert_eq!(head, LogId::new("p1"));

    // A client retrying after a lost response sends the same request again.
    let err = b
        .service
        .append("orders", patch("p1", None), Some(LogId::initial()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::VersionConflict { .. }));

    let err = b
        .service
        .append("orders", patch("p1", None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::DuplicatePatch { .. }));

    assert_eq!(cluster.transport.call_count(a.url(), "append"), 3);
    let patches = a.store.patches("orders").await.unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(
        a.service.get_patch_log_info("orders").await.unwrap().head,
        LogId::new("p1")
    );
}

#[tokio::test]
async fn test_concurrent_forwarded_appends_on_same_head() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    let c = cluster.node("c").await;

    a.service.create_patch_log("orders").await.unwrap();
    b.service.reconcile_once().await.unwrap();
    c.service.reconcile_once().await.unwrap();

    let h0 = LogId::initial();
    let (from_b, from_c) = tokio::join!(
        b.service.append("orders", patch("pb", None), Some(h0.clone())),
        c.service.append("orders", patch("pc", None), Some(h0.clone())),
    );

    let results = [from_b, from_c];
    let ok = results.iter().filter(|result| result.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|result| matches!(result, Err(ClusterError::VersionConflict { .. })))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(a.store.patches("orders").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_leader_is_retryable_forwarding_error() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    a.service.create_patch_log("orders").await.unwrap();
    b.service.reconcile_once().await.unwrap();
    cluster.transport.partition(a.url());

    let err = b
        .service
        .append("orders", patch("p1", None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Forwarding { ref leader, .. } if leader == "a"));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_slow_leader_times_out() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    a.service.create_patch_log("orders").await.unwrap();
    b.service.reconcile_once().await.unwrap();
    cluster
        .transport
        .set_delay(a.url(), Duration::from_millis(800));

    let err = b
        .service
        .append("orders", patch("p1", None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Forwarding { .. }));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_reads_fall_back_to_leader() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    a.service.create_patch_log("orders").await.unwrap();
    b.service.reconcile_once().await.unwrap();
    a.service
        .append("orders", patch("p1", None), None)
        .await
        .unwrap();
    a.service
        .append("orders", patch("p2", Some("p1")), None)
        .await
        .unwrap();

    // b holds nothing after p1, so the leader answers.
    let patches = b
        .service
        .get_patches("orders", &LogId::new("p1"))
        .await
        .unwrap();
    assert_eq!(patches, vec![patch("p2", Some("p1"))]);
    assert_eq!(cluster.transport.call_count(a.url(), "get_patches"), 1);

    // Local reads never leave the server.
    assert!(
        b.service
            .get_patches("orders", &LogId::initial())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(cluster.transport.call_count(a.url(), "get_patches"), 1);
}

#[tokio::test]
async fn test_fetched_patch_is_cached_when_it_follows_local_head() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    a.service.create_patch_log("orders").await.unwrap();
    b.service.reconcile_once().await.unwrap();
    a.service
        .append("orders", patch("p1", None), None)
        .await
        .unwrap();
    a.service
        .append("orders", patch("p2", Some("p1")), None)
        .await
        .unwrap();

    // p2 does not follow b's head: served but not cached.
    let p2 = b.service.get_patch("orders", &LogId::new("p2")).await.unwrap();
    assert_eq!(p2, Some(patch("p2", Some("p1"))));
    assert!(b.store.patches("orders").await.unwrap().is_empty());

    // p1 follows b's empty log: cached.
    let p1 = b.service.get_patch("orders", &LogId::new("p1")).await.unwrap();
    assert_eq!(p1, Some(patch("p1", None)));
    assert_eq!(
        b.service.get_patch_log_info("orders").await.unwrap().head,
        LogId::new("p1")
    );

    // Now local: no further call to the leader.
    let calls = cluster.transport.call_count(a.url(), "get_patch");
    b.service.get_patch("orders", &LogId::new("p1")).await.unwrap();
    assert_eq!(cluster.transport.call_count(a.url(), "get_patch"), calls);

    // Unknown everywhere.
    assert_eq!(
        b.service.get_patch("orders", &LogId::new("zz")).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_unknown_dataset_without_leader() {
    let cluster = TestCluster::new();
    let b = cluster.node("b").await;

    assert!(matches!(
        b.service.get_patches("missing", &LogId::initial()).await,
        Err(ClusterError::UnknownDataset(_))
    ));
    assert!(matches!(
        b.service.get_patch("missing", &LogId::new("p1")).await,
        Err(ClusterError::UnknownDataset(_))
    ));
    assert!(b.service.get_dataset_leader("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_orders_failover_scenario() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    let h0 = a.service.create_patch_log("orders").await.unwrap();
    assert_eq!(h0, LogId::initial());

    let report = b.service.reconcile_once().await.unwrap();
    assert_eq!(report.datasets_created, 1);
    assert_eq!(
        b.service.get_patch_log_info("orders").await.unwrap().head,
        h0
    );

    let h1 = a
        .service
        .append("orders", patch("p1", None), Some(h0.clone()))
        .await
        .unwrap();

    b.service.reconcile_once().await.unwrap();
    assert_eq!(
        b.service.get_patch_log_info("orders").await.unwrap().head,
        h1
    );

    a.client.close().await;
    cluster.transport.partition(a.url());
    wait_for("b to lead orders", || b.is_leader("orders")).await;

    let h2 = b
        .service
        .append("orders", patch("p2", Some("p1")), Some(h1.clone()))
        .await
        .unwrap();
    assert_eq!(h2, LogId::new("p2"));

    let record = b
        .service
        .directory()
        .dataset_record("orders")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.head, h2);

    // A stale head is refused by the new leader.
    let err = b
        .service
        .append("orders", patch("p3", Some("p1")), Some(h1))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::VersionConflict { .. }));
}
