//! Node-local executed-operation counters and their cluster-wide merge.
//!
//! Every grid member counts, per primary, the operations its topology guard
//! completed against that node. Counts from several members are summed with
//! [`ClusterMetricsSnapshot::merge`] to get what each node executed. The
//! counters are lock-free and read concurrently by the metrics collaborator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 OperationMetrics                     │
//! │                                                      │
//! │  DashMap<NodeId, NodeCounters>                       │
//! │    record_read()  ──▶ atomic increment reads         │
//! │    record_write() ──▶ atomic increment writes        │
//! └──────────────────────────┬──────────────────────────┘
//!                            │ NodeMetricsSource
//!                            ▼
//!              ClusterMetricsSnapshot::collect / merge
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use super::topology::TopologySnapshot;
use super::traits::NodeMetricsSource;
use crate::types::NodeId;

/// Point-in-time counters of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeMetrics {
    pub reads: u64,
    pub writes: u64,
}

impl NodeMetrics {
    /// Operations of any kind executed by the node.
    pub fn executed_operations(&self) -> u64 {
        self.reads + self.writes
    }
}

#[derive(Debug, Default)]
struct NodeCounters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl NodeCounters {
    fn snapshot(&self) -> NodeMetrics {
        NodeMetrics {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Executed-operation counters for the nodes hosted by this process.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    nodes: DashMap<NodeId, NodeCounters>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a node with zeroed counters.
    pub fn register(&self, node: NodeId) {
        self.nodes.entry(node).or_default();
    }

    pub fn record_read(&self, node: NodeId) {
        self.nodes
            .entry(node)
            .or_default()
            .reads
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, node: NodeId) {
        self.nodes
            .entry(node)
            .or_default()
            .writes
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl NodeMetricsSource for OperationMetrics {
    fn executed_operations(&self, node: NodeId) -> u64 {
        self.node_metrics(node)
            .map(|m| m.executed_operations())
            .unwrap_or(0)
    }

    fn node_metrics(&self, node: NodeId) -> Option<NodeMetrics> {
        self.nodes.get(&node).map(|c| c.snapshot())
    }
}

/// Counters of every node in a topology, merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterMetricsSnapshot {
    pub total_nodes: usize,
    pub total_executed_operations: u64,
    pub per_node: BTreeMap<NodeId, NodeMetrics>,
}

impl ClusterMetricsSnapshot {
    /// Merge per-node counters. Repeated nodes have their counters summed.
    pub fn merge<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, NodeMetrics)>,
    {
        let mut per_node: BTreeMap<NodeId, NodeMetrics> = BTreeMap::new();
        for (id, metrics) in nodes {
            let entry = per_node.entry(id).or_default();
            entry.reads += metrics.reads;
            entry.writes += metrics.writes;
        }
        Self {
            total_nodes: per_node.len(),
            total_executed_operations: per_node.values().map(|m| m.executed_operations()).sum(),
            per_node,
        }
    }

    /// Collect counters for every live member. Unknown nodes count as zero.
    pub fn collect(snapshot: &TopologySnapshot, source: &dyn NodeMetricsSource) -> Self {
        Self::merge(
            snapshot
                .members()
                .iter()
                .map(|id| (*id, source.node_metrics(*id).unwrap_or_default())),
        )
    }

    pub fn executed_operations(&self, node: NodeId) -> u64 {
        self.per_node
            .get(&node)
            .map(|m| m.executed_operations())
            .unwrap_or(0)
    }
}
