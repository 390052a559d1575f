//! End-to-end tests of a grid member.
//!
//! Membership arrives through the discovery listener, the planner moves
//! partition data in the loopback backend, and clients read and write through
//! the near cache while the cluster scales out and in.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use gridaffinity::cluster::{
    AffinityEngine, ClusterConfig, ClusterProfile, DiscoveryEvent, Grid, InMemoryGrid,
    NodeAttributes, NodeSpec, TxConcurrency, TxIsolation, TxState, compute_movements,
};
use gridaffinity::constants::{ATTR_HOST_MACS, DISCOVERY_CHANNEL_CAPACITY};
use gridaffinity::telemetry::init_test_logging;
use gridaffinity::types::{NodeId, TopologyVersion};
use tokio::sync::mpsc;

fn id(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

fn server_on(n: u128, host: &str) -> DiscoveryEvent {
    let attributes = NodeAttributes::new().with(ATTR_HOST_MACS, host).unwrap();
    DiscoveryEvent::Join(NodeSpec::server(id(n)).with_attributes(attributes))
}

fn plans_between(engine: &AffinityEngine, from: TopologyVersion, to: TopologyVersion) -> usize {
    let mut total = 0;
    let mut previous = engine.assignment_at(from).unwrap();
    let mut v = from.next();
    while v <= to {
        let next = engine.assignment_at(v).unwrap();
        total += compute_movements(&previous, &next).len();
        previous = next;
        v = v.next();
    }
    total
}

async fn settle(grid: &Grid, backend: &InMemoryGrid, version: TopologyVersion, plans: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        grid.registry().wait_for_version(version).await;
        while backend.executed_plans().len() < plans {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("grid did not settle");
}

#[tokio::test]
async fn test_scale_out_and_in_keeps_data_readable() {
    init_test_logging();

    let config = ClusterConfig::from_profile(ClusterProfile::Development)
        .with_partitions(128)
        .with_backups(1)
        .with_exclusion_attribute(ATTR_HOST_MACS);
    let backend = Arc::new(InMemoryGrid::applying_plans());
    let grid = Grid::new(config, backend.clone(), backend.clone()).unwrap();
    let planner_task = grid.start_planner();

    let (events, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
    let listener = grid.registry().spawn_discovery_listener(rx);

    events.send(server_on(1, "host-a")).await.unwrap();
    events.send(server_on(2, "host-a")).await.unwrap();
    events.send(server_on(3, "host-b")).await.unwrap();
    events.send(server_on(4, "host-b")).await.unwrap();
    events
        .send(DiscoveryEvent::Join(NodeSpec::client(id(100))))
        .await
        .unwrap();

    let v5 = TopologyVersion::new(5);
    grid.registry().wait_for_version(v5).await;
    let initial_plans = plans_between(grid.engine(), TopologyVersion::INITIAL, v5);
    settle(&grid, &backend, v5, initial_plans).await;

    // Copies of every partition sit on both hosts.
    let snapshot = grid.registry().current();
    for (_, owners) in grid.engine().current().iter() {
        let hosts: HashSet<_> = owners
            .iter()
            .map(|n| snapshot.node(n).unwrap().attribute(ATTR_HOST_MACS).unwrap())
            .collect();
        assert_eq!(hosts.len(), 2);
    }

    let client = grid.near_client();
    for i in 0..200 {
        client.put(format!("k{}", i), format!("v{}", i)).await.unwrap();
    }

    // Scale out onto a third host.
    events.send(server_on(5, "host-c")).await.unwrap();
    let v6 = TopologyVersion::new(6);
    grid.registry().wait_for_version(v6).await;
    settle(&grid, &backend, v6, initial_plans + plans_between(grid.engine(), v5, v6)).await;

    for i in 0..200 {
        let value = client.get(format!("k{}", i)).await.unwrap();
        assert_eq!(value.as_deref(), Some(format!("v{}", i).as_bytes()));
    }
    assert_eq!(client.near_cache().unwrap().local_version(), v6);

    // Acknowledge everything the storage side finished.
    for plan in backend.executed_plans() {
        grid.planner().acknowledge(plan.partition, plan.plan_id).await;
    }
    assert!(grid.planner().in_flight_partitions().is_empty());

    // The client leaving moves nothing.
    let issued = backend.executed_plans().len();
    events
        .send(DiscoveryEvent::Leave { id: id(100) })
        .await
        .unwrap();
    grid.registry().wait_for_version(TopologyVersion::new(7)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.executed_plans().len(), issued);

    drop(events);
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
    grid.planner().stop();
    tokio::time::timeout(Duration::from_secs(5), planner_task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_transaction_commits_through_a_near_client() {
    init_test_logging();

    let config = ClusterConfig::from_profile(ClusterProfile::Production).with_partitions(64);
    let backend = Arc::new(InMemoryGrid::new());
    let grid = Grid::new(config, backend.clone(), backend.clone()).unwrap();
    for n in 1..=3 {
        grid.registry().join(NodeSpec::server(id(n))).await.unwrap();
    }

    let client = grid.near_client();
    client.put("balance", "10").await.unwrap();

    let mut tx = client.tx_start(TxConcurrency::Pessimistic, TxIsolation::RepeatableRead);
    assert_eq!(tx.get("balance").await.unwrap().as_deref(), Some(&b"10"[..]));
    tx.put("balance", "20").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(tx.state(), TxState::Committed);
    let partition = grid.engine().partition(b"balance");
    let primary = grid.engine().map_key_to_node(b"balance").unwrap();
    assert_eq!(
        backend.stored(primary, partition, b"balance").as_deref(),
        Some(&b"20"[..])
    );
}
