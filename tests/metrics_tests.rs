//! Tests for the metrics module.
//!
//! Metrics are process-global and tests run in parallel, so these tests check
//! that values move forward rather than exact totals.

mod common;

use patchlog_cluster::cluster::metrics;
use patchlog_cluster::types::{LogId, Patch};

use common::TestCluster;

#[test]
fn test_encode_metrics_uses_namespace() {
    metrics::record_session_event("connected");
    let encoded = metrics::encode_metrics().unwrap();
    assert!(encoded.contains("patchlog_session_events_total"));
}

#[tokio::test]
async fn test_requests_are_counted() {
    let cluster = TestCluster::new();
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    let elections_before = metrics::LEADER_ELECTIONS.with_label_values(&["won"]).get();
    a.service.create_patch_log("metrics-orders").await.unwrap();
    assert!(metrics::LEADER_ELECTIONS.with_label_values(&["won"]).get() > elections_before);

    b.service.reconcile_once().await.unwrap();

    let local_before = metrics::APPENDS.with_label_values(&["local", "success"]).get();
    let forwarded_before = metrics::APPENDS
        .with_label_values(&["forwarded", "success"])
        .get();

    a.service
        .append("metrics-orders", Patch::new("m1", None, "x"), Some(LogId::initial()))
        .await
        .unwrap();
    b.service
        .append("metrics-orders", Patch::new("m2", Some(LogId::new("m1")), "y"), None)
        .await
        .unwrap();

    // The forwarded append is also a local append on the leader.
    assert!(metrics::APPENDS.with_label_values(&["local", "success"]).get() >= local_before + 2);
    assert!(
        metrics::APPENDS
            .with_label_values(&["forwarded", "success"])
            .get()
            > forwarded_before
    );

    let rounds_before = metrics::SYNC_ROUNDS.get();
    b.service.reconcile_once().await.unwrap();
    assert!(metrics::SYNC_ROUNDS.get() > rounds_before);
}
