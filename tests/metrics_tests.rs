//! Tests for the Prometheus metrics module.
//!
//! Metrics use global state and other tests run in parallel, so these tests
//! only assert properties that hold regardless of concurrent recording.

use std::sync::Arc;

use gridaffinity::cluster::{ClusterConfig, ClusterProfile, Grid, InMemoryGrid, NodeSpec, metrics};
use gridaffinity::types::NodeId;
use serial_test::serial;

#[test]
#[serial]
fn test_encode_after_init_lists_every_family() {
    metrics::init_metrics();
    metrics::record_topology_published(1, 1, 0);
    let text = metrics::encode_metrics().unwrap();

    for name in [
        "gridaffinity_topology_version",
        "gridaffinity_live_nodes",
        "gridaffinity_degraded_partitions",
        "gridaffinity_near_cache_entries",
    ] {
        assert!(text.contains(name), "missing {}", name);
    }
}

#[tokio::test]
#[serial]
async fn test_grid_activity_is_recorded() {
    let before_admitted = metrics::DISCOVERY_EVENTS
        .with_label_values(&["join", "admitted"])
        .get();
    let before_hits = metrics::NEAR_CACHE_OPERATIONS
        .with_label_values(&["get", "hit"])
        .get();

    let backend = Arc::new(InMemoryGrid::new());
    let config = ClusterConfig::from_profile(ClusterProfile::Production).with_partitions(16);
    let grid = Grid::new(config, backend.clone(), backend).unwrap();
    grid.registry()
        .join(NodeSpec::server(NodeId::random()))
        .await
        .unwrap();

    let client = grid.near_client();
    client.put("k", "v").await.unwrap();
    client.get("k").await.unwrap();

    assert!(
        metrics::DISCOVERY_EVENTS
            .with_label_values(&["join", "admitted"])
            .get()
            > before_admitted
    );
    assert!(
        metrics::NEAR_CACHE_OPERATIONS
            .with_label_values(&["get", "hit"])
            .get()
            > before_hits
    );

    let text = metrics::encode_metrics().unwrap();
    assert!(text.contains("gridaffinity_remote_call_duration_seconds"));
}

#[test]
fn test_topology_loss_counter_is_labelled() {
    let before = metrics::TOPOLOGY_LOSS.with_label_values(&["transaction"]).get();
    metrics::record_topology_loss("transaction");
    assert!(metrics::TOPOLOGY_LOSS.with_label_values(&["transaction"]).get() > before);
}
