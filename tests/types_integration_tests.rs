//! Integration tests for the types module.
//!
//! These tests verify the identity and versioning newtypes.

use std::collections::BTreeSet;

use gridaffinity::types::{JoinOrder, NodeId, PartitionId, PlanId, TopologyVersion};
use uuid::Uuid;

// ============================================================================
// NodeId Tests
// ============================================================================

#[test]
fn test_node_id_from_uuid() {
    let uuid = Uuid::from_u128(99);
    assert_eq!(NodeId::from(uuid), NodeId::from_u128(99));
    assert_eq!(NodeId::from(uuid).to_string(), uuid.to_string());
}

#[test]
fn test_node_id_bytes_are_big_endian_uuid_bytes() {
    let id = NodeId::from_u128(1);
    let bytes = id.as_bytes();
    assert_eq!(bytes[15], 1);
    assert!(bytes[..15].iter().all(|b| *b == 0));
}

#[test]
fn test_node_id_serde_round_trip() {
    let id = NodeId::random();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(serde_json::from_str::<NodeId>(&json).unwrap(), id);
}

// ============================================================================
// TopologyVersion Tests
// ============================================================================

#[test]
fn test_topology_version_initial_is_zero() {
    assert_eq!(TopologyVersion::INITIAL.value(), 0);
    assert_eq!(TopologyVersion::default(), TopologyVersion::INITIAL);
}

#[test]
fn test_topology_version_from_u64() {
    let v: TopologyVersion = 5u64.into();
    assert_eq!(v, TopologyVersion::new(5));
    assert_eq!(v.next().to_string(), "v6");
}

#[test]
fn test_topology_versions_sort_numerically() {
    let versions: BTreeSet<_> = [10u64, 2, 33, 1]
        .into_iter()
        .map(TopologyVersion::new)
        .collect();
    let sorted: Vec<u64> = versions.into_iter().map(|v| v.value()).collect();
    assert_eq!(sorted, vec![1, 2, 10, 33]);
}

// ============================================================================
// JoinOrder / PartitionId / PlanId Tests
// ============================================================================

#[test]
fn test_join_order_ordering() {
    assert!(JoinOrder::new(1) < JoinOrder::new(2));
    assert_eq!(JoinOrder::new(4).value(), 4);
    assert_eq!(JoinOrder::new(4).to_string(), "4");
}

#[test]
fn test_partition_id_conversions() {
    let p: PartitionId = 1023u32.into();
    assert_eq!(p.value(), 1023);
    assert_eq!(p.index(), 1023usize);
}

#[test]
fn test_plan_id_display() {
    assert_eq!(PlanId(12).to_string(), "plan-12");
}
