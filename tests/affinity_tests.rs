//! Tests for the affinity function.
//!
//! These tests verify placement properties over whole assignments:
//! determinism, replica counts, neighborhood exclusion, minimal disruption
//! and the exclusion of client nodes.

use std::collections::HashSet;
use std::sync::Arc;

use gridaffinity::cluster::{
    AffinityConfig, AffinityEngine, NodeAttributes, NodeSpec, TopologyRegistry, assign,
};
use gridaffinity::constants::{ATTR_HOST_MACS, ATTR_RACK};
use gridaffinity::types::{NodeId, PartitionId};

fn id(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

async fn registry_with_servers(ids: impl IntoIterator<Item = u128>) -> TopologyRegistry {
    let registry = TopologyRegistry::new(64);
    for n in ids {
        registry.join(NodeSpec::server(id(n))).await.unwrap();
    }
    registry
}

// ============================================================================
// Determinism
// ============================================================================

#[tokio::test]
async fn test_assign_is_deterministic() {
    let registry = registry_with_servers(1..=5).await;
    let config = AffinityConfig::new(1024, 2);
    let snapshot = registry.current();

    assert_eq!(assign(&snapshot, &config), assign(&snapshot, &config));
}

#[tokio::test]
async fn test_members_agree_regardless_of_join_order() {
    // Two members observing the same membership must compute the same owners.
    let a = registry_with_servers([1, 2, 3, 4]).await;
    let b = registry_with_servers([4, 2, 1, 3]).await;
    let config = AffinityConfig::new(512, 1);

    let left = assign(&a.current(), &config);
    let right = assign(&b.current(), &config);
    for p in 0..512 {
        let partition = PartitionId(p);
        assert_eq!(left.owners(partition), right.owners(partition));
    }
}

// ============================================================================
// Replica counts
// ============================================================================

#[tokio::test]
async fn test_distinct_owner_count_is_min_of_copies_and_servers() {
    for servers in 1..=5u128 {
        let registry = registry_with_servers(1..=servers).await;
        for backups in 0..=3usize {
            let assignment = assign(&registry.current(), &AffinityConfig::new(128, backups));
            let expected = (backups + 1).min(servers as usize);
            for (partition, owners) in assignment.iter() {
                let distinct: HashSet<_> = owners.iter().collect();
                assert_eq!(
                    distinct.len(),
                    expected,
                    "partition {} with {} servers and {} backups",
                    partition,
                    servers,
                    backups
                );
                assert_eq!(owners.len(), expected);
            }
        }
    }
}

#[tokio::test]
async fn test_single_node_with_one_backup_has_primary_only() {
    let registry = registry_with_servers([1]).await;
    let assignment = assign(&registry.current(), &AffinityConfig::new(1024, 1));

    for (_, owners) in assignment.iter() {
        assert_eq!(owners, &[id(1)]);
    }
    assert_eq!(assignment.degraded_count(), 1024);
    assert!(assignment.backup_nodes(PartitionId(0)).is_empty());
}

#[tokio::test]
async fn test_primaries_are_spread_across_servers() {
    let registry = registry_with_servers(1..=4).await;
    let assignment = assign(&registry.current(), &AffinityConfig::new(1024, 0));

    for n in 1..=4 {
        let owned = assignment.primary_partitions(id(n)).len();
        assert!(owned > 150, "node {} owns only {} primaries", n, owned);
    }
}

// ============================================================================
// Neighborhood exclusion
// ============================================================================

#[tokio::test]
async fn test_exclusion_places_copies_on_distinct_hosts() {
    let registry = TopologyRegistry::new(64);
    let hosts = ["00:00:00:00:00:01", "00:00:00:00:00:02", "00:00:00:00:00:03"];
    for n in 0..9u128 {
        let attributes = NodeAttributes::new()
            .with(ATTR_HOST_MACS, hosts[(n % 3) as usize])
            .unwrap();
        registry
            .join(NodeSpec::server(id(n + 1)).with_attributes(attributes))
            .await
            .unwrap();
    }

    let snapshot = registry.current();
    let config = AffinityConfig::new(1024, 2).with_exclusion_attribute(ATTR_HOST_MACS);
    let assignment = assign(&snapshot, &config);

    assert_eq!(assignment.degraded_count(), 0);
    for (partition, owners) in assignment.iter() {
        assert_eq!(owners.len(), 3);
        let groups: HashSet<_> = owners
            .iter()
            .map(|n| snapshot.node(n).unwrap().attribute(ATTR_HOST_MACS).unwrap())
            .collect();
        assert_eq!(groups.len(), 3, "partition {} shares a host", partition);
    }
}

#[tokio::test]
async fn test_exclusion_degrades_when_groups_run_out() {
    let registry = TopologyRegistry::new(64);
    for n in 1..=4u128 {
        let host = if n <= 2 { "aa" } else { "bb" };
        let attributes = NodeAttributes::new().with(ATTR_HOST_MACS, host).unwrap();
        registry
            .join(NodeSpec::server(id(n)).with_attributes(attributes))
            .await
            .unwrap();
    }

    let config = AffinityConfig::new(64, 2).with_exclusion_attribute(ATTR_HOST_MACS);
    let assignment = assign(&registry.current(), &config);

    // Only two groups exist, so every partition gets two copies instead of three.
    for (_, owners) in assignment.iter() {
        assert_eq!(owners.len(), 2);
    }
    assert_eq!(assignment.degraded_count(), 64);
}

#[tokio::test]
async fn test_overlapping_mac_sets_are_neighbors() {
    let registry = TopologyRegistry::new(64);
    let hosts = [
        "00:00:00:00:00:01,00:00:00:00:00:02",
        "00:00:00:00:00:02, 00:00:00:00:00:03",
        "00:00:00:00:00:04",
    ];
    for (n, macs) in hosts.iter().enumerate() {
        let attributes = NodeAttributes::new().with(ATTR_HOST_MACS, *macs).unwrap();
        registry
            .join(NodeSpec::server(id(n as u128 + 1)).with_attributes(attributes))
            .await
            .unwrap();
    }

    let config = AffinityConfig::new(256, 2).with_exclusion_attribute(ATTR_HOST_MACS);
    let assignment = assign(&registry.current(), &config);

    // Nodes 1 and 2 share a MAC, so no partition holds both of them.
    for (partition, owners) in assignment.iter() {
        assert_eq!(owners.len(), 2, "partition {}", partition);
        assert!(owners.contains(&id(3)));
        assert!(!(owners.contains(&id(1)) && owners.contains(&id(2))));
    }
    assert_eq!(assignment.degraded_count(), 256);
}

#[tokio::test]
async fn test_exclusion_on_other_attributes_compares_whole_values() {
    let registry = TopologyRegistry::new(64);
    for (n, rack) in ["r1,r2", "r2"].iter().enumerate() {
        let attributes = NodeAttributes::new().with(ATTR_RACK, *rack).unwrap();
        registry
            .join(NodeSpec::server(id(n as u128 + 1)).with_attributes(attributes))
            .await
            .unwrap();
    }

    let config = AffinityConfig::new(64, 1).with_exclusion_attribute(ATTR_RACK);
    let assignment = assign(&registry.current(), &config);

    assert_eq!(assignment.degraded_count(), 0);
    for (_, owners) in assignment.iter() {
        assert_eq!(owners.len(), 2);
    }
}

#[tokio::test]
async fn test_nodes_without_attribute_never_conflict() {
    let registry = registry_with_servers(1..=3).await;
    let config = AffinityConfig::new(64, 2).with_exclusion_attribute(ATTR_HOST_MACS);
    let assignment = assign(&registry.current(), &config);

    for (_, owners) in assignment.iter() {
        assert_eq!(owners.len(), 3);
    }
}

// ============================================================================
// Minimal disruption
// ============================================================================

#[tokio::test]
async fn test_removing_a_node_only_moves_its_partitions() {
    let registry = registry_with_servers(1..=6).await;
    let config = AffinityConfig::new(1024, 1);
    let before = assign(&registry.current(), &config);

    let departed = id(3);
    registry.leave(departed).await.unwrap();
    let after = assign(&registry.current(), &config);

    let mut affected = 0;
    for p in 0..1024 {
        let partition = PartitionId(p);
        if before.is_owner(partition, departed) {
            affected += 1;
            assert!(!after.is_owner(partition, departed));
        } else {
            assert_eq!(before.owners(partition), after.owners(partition));
        }
    }
    assert!(affected > 0);
    assert!(affected < 1024);
}

#[tokio::test]
async fn test_adding_a_node_only_moves_partitions_it_takes() {
    let registry = registry_with_servers(1..=5).await;
    let config = AffinityConfig::new(1024, 1);
    let before = assign(&registry.current(), &config);

    registry.join(NodeSpec::server(id(6))).await.unwrap();
    let after = assign(&registry.current(), &config);

    for p in 0..1024 {
        let partition = PartitionId(p);
        if !after.is_owner(partition, id(6)) {
            assert_eq!(before.owners(partition), after.owners(partition));
        }
    }
}

// ============================================================================
// Client nodes
// ============================================================================

#[tokio::test]
async fn test_client_nodes_never_own_partitions() {
    let registry = Arc::new(TopologyRegistry::new(64));
    for n in 1..=3 {
        registry.join(NodeSpec::server(id(n))).await.unwrap();
    }
    for n in 4..=6 {
        registry.join(NodeSpec::client(id(n))).await.unwrap();
    }

    let engine = AffinityEngine::new(AffinityConfig::new(1024, 1), registry.clone(), 16).unwrap();
    for n in 4..=6 {
        assert!(engine.primary_partitions(id(n)).is_empty());
        assert!(engine.backup_partitions(id(n)).is_empty());
    }

    let owners = engine.map_key_to_primary_and_backups(b"user:42");
    assert_eq!(owners.len(), 2);
    assert!(owners.iter().all(|n| [id(1), id(2), id(3)].contains(n)));
}

#[tokio::test]
async fn test_clients_only_topology_has_no_owners() {
    let registry = Arc::new(TopologyRegistry::new(64));
    registry.join(NodeSpec::client(id(1))).await.unwrap();

    let engine = AffinityEngine::new(AffinityConfig::new(16, 1), registry, 16).unwrap();
    assert!(engine.map_key_to_node(b"k").is_none());
    assert!(engine.map_key_to_primary_and_backups(b"k").is_empty());
}

// ============================================================================
// Key mapping
// ============================================================================

#[tokio::test]
async fn test_key_queries_agree_with_assignment() {
    let registry = Arc::new(registry_with_servers(1..=4).await);
    let engine = AffinityEngine::new(AffinityConfig::new(256, 2), registry, 16).unwrap();
    let assignment = engine.current();

    for i in 0..100 {
        let key = format!("key-{}", i);
        let partition = engine.partition(key.as_bytes());
        let owners = engine.map_key_to_primary_and_backups(key.as_bytes());

        assert_eq!(owners, assignment.owners(partition));
        assert_eq!(engine.map_key_to_node(key.as_bytes()), owners.first().copied());
        for owner in &owners {
            assert!(engine.is_primary_or_backup(*owner, key.as_bytes()));
        }
    }
}
