//! Tests for the topology guard.
//!
//! These tests verify ownership validation against the version an operation
//! started under, escalation of unreachable primaries, cancellation of calls
//! whose primary departs, undo of applied writes, and the single-key retry
//! policy.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gridaffinity::cluster::{
    ClusterConfig, ClusterError, Grid, InMemoryGrid, NodeSpec, OperationKind, RetryMode,
    TopologyRetryPolicy,
};
use gridaffinity::types::NodeId;

fn id(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

fn fast_config(policy: TopologyRetryPolicy) -> ClusterConfig {
    ClusterConfig {
        unreachable_max_retries: 3,
        unreachable_min_backoff: Duration::from_millis(1),
        unreachable_max_backoff: Duration::from_millis(5),
        ..ClusterConfig::new(policy).with_partitions(64)
    }
}

async fn grid_with_servers(config: ClusterConfig, servers: u128) -> (Grid, Arc<InMemoryGrid>) {
    let backend = Arc::new(InMemoryGrid::new());
    let grid = Grid::new(config, backend.clone(), backend.clone()).unwrap();
    for n in 1..=servers {
        grid.registry().join(NodeSpec::server(id(n))).await.unwrap();
        backend.add_node(id(n));
    }
    (grid, backend)
}

fn key() -> Bytes {
    Bytes::from_static(b"account:1")
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_version_change_without_owner_change_is_accepted() {
    let (grid, _) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let guard = grid.guard();
    let partition = grid.engine().partition(&key());

    let mut ctx = guard.begin(OperationKind::Read);
    grid.registry().join(NodeSpec::client(id(10))).await.unwrap();

    let current = guard.validate(&mut ctx, partition).unwrap();
    assert_ne!(current.version(), ctx.start_version());
    assert_eq!(current.owners(partition), ctx.owners_at_start(partition));
}

#[tokio::test]
async fn test_owner_change_is_topology_loss() {
    let (grid, _) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let guard = grid.guard();
    let partition = grid.engine().partition(&key());

    let mut ctx = guard.begin(OperationKind::Write);
    let primary = grid.engine().map_key_to_node(&key()).unwrap();
    grid.registry().leave(primary).await.unwrap();

    let err = guard.validate(&mut ctx, partition).unwrap_err();
    assert!(matches!(
        err,
        ClusterError::TopologyLoss { partition: p, started_at, current }
            if p == partition && started_at < current
    ));
}

#[tokio::test]
async fn test_partition_without_owners_is_topology_loss() {
    let (grid, _) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 0).await;
    grid.registry().join(NodeSpec::client(id(1))).await.unwrap();

    let err = grid.guard().get(key()).await.unwrap_err();
    assert!(err.is_topology_loss());
}

#[tokio::test]
async fn test_validate_all_checks_every_touched_partition() {
    let (grid, _) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 4).await;
    let guard = grid.guard();
    let departed = id(2);

    let mut ctx = guard.begin(OperationKind::Transaction);
    for p in grid.engine().current().primary_partitions(departed) {
        ctx.touch(p);
    }
    assert!(guard.validate_all(&mut ctx).is_ok());

    grid.registry().leave(departed).await.unwrap();
    assert!(guard.validate_all(&mut ctx).unwrap_err().is_topology_loss());
}

// ============================================================================
// Unreachable primaries
// ============================================================================

#[tokio::test]
async fn test_transient_unreachable_is_retried() {
    let (grid, backend) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let primary = grid.engine().map_key_to_node(&key()).unwrap();

    grid.guard()
        .put(key(), Bytes::from_static(b"100"))
        .await
        .unwrap();
    backend.fail_next(primary, 2);

    let read = grid.guard().get(key()).await.unwrap();
    assert_eq!(read.value, Some(Bytes::from_static(b"100")));
    assert_eq!(read.primary, primary);
}

#[tokio::test]
async fn test_exhausted_retries_on_live_node_are_fatal() {
    let (grid, backend) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let primary = grid.engine().map_key_to_node(&key()).unwrap();
    backend.stop(primary);

    let err = grid.guard().get(key()).await.unwrap_err();
    assert!(matches!(err, ClusterError::Io(ref msg) if msg.contains(&primary.to_string())));
}

#[tokio::test]
async fn test_unreachable_node_that_departs_is_topology_loss() {
    let config = ClusterConfig {
        unreachable_max_retries: 50,
        unreachable_min_backoff: Duration::from_millis(20),
        unreachable_max_backoff: Duration::from_millis(20),
        ..fast_config(TopologyRetryPolicy::always_abort())
    };
    let (grid, backend) = grid_with_servers(config, 3).await;
    let grid = Arc::new(grid);
    let primary = grid.engine().map_key_to_node(&key()).unwrap();
    backend.stop(primary);

    let task = {
        let grid = grid.clone();
        tokio::spawn(async move { grid.guard().get(key()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    grid.registry().leave(primary).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().is_topology_loss());
}

// ============================================================================
// Departure mid-call
// ============================================================================

#[tokio::test]
async fn test_departure_cancels_blocked_call() {
    let (grid, backend) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let grid = Arc::new(grid);
    let primary = grid.engine().map_key_to_node(&key()).unwrap();
    backend.stall(primary);

    let task = {
        let grid = grid.clone();
        tokio::spawn(async move { grid.guard().put(key(), Bytes::from_static(b"v")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    grid.registry().leave(primary).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("blocked call was not cancelled")
        .unwrap();
    assert!(result.unwrap_err().is_topology_loss());
}

#[tokio::test]
async fn test_stalled_call_times_out_as_io() {
    let config = ClusterConfig {
        remote_call_timeout: Duration::from_millis(20),
        unreachable_max_retries: 1,
        ..fast_config(TopologyRetryPolicy::always_abort())
    };
    let (grid, backend) = grid_with_servers(config, 2).await;
    let primary = grid.engine().map_key_to_node(&key()).unwrap();
    backend.stall(primary);

    let err = grid.guard().get(key()).await.unwrap_err();
    assert!(matches!(err, ClusterError::Io(_)));
}

// ============================================================================
// Single-key retry policy
// ============================================================================

#[tokio::test]
async fn test_retry_once_reruns_under_new_topology() {
    let policy = TopologyRetryPolicy::new(RetryMode::Abort, RetryMode::RetryOnce);
    let (grid, backend) = grid_with_servers(fast_config(policy), 3).await;
    let grid = Arc::new(grid);
    let primary = grid.engine().map_key_to_node(&key()).unwrap();
    backend.stall(primary);

    let task = {
        let grid = grid.clone();
        tokio::spawn(async move { grid.guard().put(key(), Bytes::from_static(b"v2")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    grid.registry().leave(primary).await.unwrap();

    let write = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_ne!(write.primary, primary);
    assert_eq!(write.version, grid.registry().version());

    let partition = grid.engine().partition(&key());
    assert_eq!(
        backend.stored(write.primary, partition, &key()),
        Some(Bytes::from_static(b"v2"))
    );
}

#[tokio::test]
async fn test_abort_policy_surfaces_topology_loss_for_reads() {
    let policy = TopologyRetryPolicy::new(RetryMode::Abort, RetryMode::RetryOnce);
    let (grid, backend) = grid_with_servers(fast_config(policy), 3).await;
    let grid = Arc::new(grid);
    let primary = grid.engine().map_key_to_node(&key()).unwrap();
    backend.stall(primary);

    let task = {
        let grid = grid.clone();
        tokio::spawn(async move { grid.guard().get(key()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    grid.registry().leave(primary).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().is_topology_loss());
}

// ============================================================================
// Undoing writes
// ============================================================================

#[tokio::test]
async fn test_restore_puts_back_the_replaced_value() {
    let (grid, backend) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let guard = grid.guard();

    let first = guard.put(key(), Bytes::from_static(b"1")).await.unwrap();
    assert_eq!(first.previous, None);
    let second = guard.put(key(), Bytes::from_static(b"2")).await.unwrap();
    assert_eq!(second.previous, Some(Bytes::from_static(b"1")));

    guard.restore(key(), &second).await.unwrap();
    assert_eq!(
        backend.stored(second.primary, second.partition, &key()),
        Some(Bytes::from_static(b"1"))
    );
    guard.restore(key(), &first).await.unwrap();
    assert_eq!(backend.stored(first.primary, first.partition, &key()), None);
}

#[tokio::test]
async fn test_restore_on_departed_node_is_reported() {
    let (grid, backend) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let write = grid.guard().put(key(), Bytes::from_static(b"v")).await.unwrap();
    grid.registry().leave(write.primary).await.unwrap();

    let err = grid.guard().restore(key(), &write).await.unwrap_err();
    assert_eq!(err, ClusterError::NodeDeparted { node: write.primary });
    assert!(!err.is_retriable());
    // Nothing was sent to the departed node.
    assert_eq!(
        backend.stored(write.primary, write.partition, &key()),
        Some(Bytes::from_static(b"v"))
    );
}

#[tokio::test]
async fn test_restore_on_unreachable_node_gives_up() {
    let (grid, backend) = grid_with_servers(fast_config(TopologyRetryPolicy::always_abort()), 3).await;
    let write = grid.guard().put(key(), Bytes::from_static(b"v")).await.unwrap();
    backend.fail_next(write.primary, 2);

    // Transient failures are retried while the node stays live.
    grid.guard().restore(key(), &write).await.unwrap();
    assert_eq!(backend.stored(write.primary, write.partition, &key()), None);

    backend.stop(write.primary);
    let err = grid.guard().restore(key(), &write).await.unwrap_err();
    assert!(err.is_retriable());
}
