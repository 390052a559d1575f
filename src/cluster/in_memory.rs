//! Loopback implementation of the collaborator traits.
//!
//! `InMemoryGrid` plays the remote side of a cluster inside one process: a
//! key/value store per (node, partition), the counters each node would keep
//! of the operations it served, and a movement executor that records plans and can apply them by copying
//! partition data between nodes.
//!
//! # Fault injection
//!
//! - [`InMemoryGrid::stop`]: the node refuses every call (`NodeUnreachable`)
//! - [`InMemoryGrid::fail_next`]: the next `n` calls fail with `NodeUnreachable`
//! - [`InMemoryGrid::stall`]: calls never complete
//!
//! Faults only affect the transport. Membership changes still have to be
//! reported to the `TopologyRegistry`, as the discovery collaborator would.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::error::{ClusterError, ClusterResult};
use super::operation_metrics::{NodeMetrics, OperationMetrics};
use super::planner::MovementPlan;
use super::traits::{MovementExecutor, NodeMetricsSource, PrimaryTransport};
use crate::types::{NodeId, PartitionId, PlanId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Stopped,
    FailNext(u32),
    Stalled,
}

/// In-process stand-in for the remote nodes of a grid.
#[derive(Debug, Default)]
pub struct InMemoryGrid {
    stores: DashMap<(NodeId, PartitionId), HashMap<Bytes, Bytes>>,
    faults: DashMap<NodeId, Fault>,
    metrics: Arc<OperationMetrics>,
    executed: Mutex<Vec<MovementPlan>>,
    cancelled: Mutex<Vec<(PartitionId, PlanId)>>,
    apply_on_execute: bool,
}

impl InMemoryGrid {
    /// Grid that only records movement plans.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grid that also applies movement plans as soon as they are executed.
    pub fn applying_plans() -> Self {
        Self {
            apply_on_execute: true,
            ..Self::default()
        }
    }

    /// Counters for the nodes of this grid.
    pub fn metrics(&self) -> &Arc<OperationMetrics> {
        &self.metrics
    }

    /// Register a node so its counters exist before it executes anything.
    pub fn add_node(&self, node: NodeId) {
        self.metrics.register(node);
    }

    pub fn stop(&self, node: NodeId) {
        self.faults.insert(node, Fault::Stopped);
    }

    pub fn fail_next(&self, node: NodeId, calls: u32) {
        self.faults.insert(node, Fault::FailNext(calls));
    }

    pub fn stall(&self, node: NodeId) {
        self.faults.insert(node, Fault::Stalled);
    }

    /// Clear any injected fault.
    pub fn restore(&self, node: NodeId) {
        self.faults.remove(&node);
    }

    /// Value stored on a node, bypassing the transport and counters.
    pub fn stored(&self, node: NodeId, partition: PartitionId, key: &[u8]) -> Option<Bytes> {
        self.stores
            .get(&(node, partition))
            .and_then(|m| m.get(key).cloned())
    }

    /// Number of keys a node holds for a partition.
    pub fn partition_len(&self, node: NodeId, partition: PartitionId) -> usize {
        self.stores
            .get(&(node, partition))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn executed_plans(&self) -> Vec<MovementPlan> {
        self.executed
            .lock()
            .map(|plans| plans.clone())
            .unwrap_or_default()
    }

    pub fn cancelled_plans(&self) -> Vec<(PartitionId, PlanId)> {
        self.cancelled
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Copy the partition from the first source that has it, then drop it from
    /// the nodes that lost ownership.
    pub fn apply(&self, plan: &MovementPlan) {
        let data = plan
            .sources
            .iter()
            .find_map(|s| self.stores.get(&(*s, plan.partition)).map(|m| m.clone()))
            .unwrap_or_default();

        for target in &plan.to_populate {
            self.stores.insert((*target, plan.partition), data.clone());
        }
        for dropped in &plan.to_drop {
            self.stores.remove(&(*dropped, plan.partition));
        }
        debug!(
            partition = %plan.partition,
            plan = %plan.plan_id,
            keys = data.len(),
            "Applied movement plan"
        );
    }

    /// Fail or stall according to the node's injected fault.
    async fn check_fault(&self, node: NodeId) -> ClusterResult<()> {
        let fault = self.faults.get(&node).map(|f| *f);
        match fault {
            None => Ok(()),
            Some(Fault::Stalled) => std::future::pending().await,
            Some(Fault::Stopped) => Err(ClusterError::NodeUnreachable {
                node,
                reason: "node stopped".to_string(),
            }),
            Some(Fault::FailNext(remaining)) => {
                if remaining <= 1 {
                    self.faults.remove(&node);
                } else {
                    self.faults.insert(node, Fault::FailNext(remaining - 1));
                }
                Err(ClusterError::NodeUnreachable {
                    node,
                    reason: "injected failure".to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl PrimaryTransport for InMemoryGrid {
    async fn get(
        &self,
        node: NodeId,
        partition: PartitionId,
        key: Bytes,
    ) -> ClusterResult<Option<Bytes>> {
        self.check_fault(node).await?;
        self.metrics.record_read(node);
        Ok(self.stored(node, partition, &key))
    }

    async fn put(
        &self,
        node: NodeId,
        partition: PartitionId,
        key: Bytes,
        value: Bytes,
    ) -> ClusterResult<Option<Bytes>> {
        self.check_fault(node).await?;
        self.metrics.record_write(node);
        Ok(self
            .stores
            .entry((node, partition))
            .or_default()
            .insert(key, value))
    }

    async fn remove(
        &self,
        node: NodeId,
        partition: PartitionId,
        key: Bytes,
    ) -> ClusterResult<Option<Bytes>> {
        self.check_fault(node).await?;
        self.metrics.record_write(node);
        Ok(self
            .stores
            .get_mut(&(node, partition))
            .and_then(|mut m| m.remove(&key)))
    }
}

#[async_trait]
impl MovementExecutor for InMemoryGrid {
    async fn execute(&self, plan: MovementPlan) -> Result<(), String> {
        if self.apply_on_execute {
            self.apply(&plan);
        }
        self.executed
            .lock()
            .map_err(|e| e.to_string())?
            .push(plan);
        Ok(())
    }

    async fn cancel(&self, partition: PartitionId, plan_id: PlanId) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push((partition, plan_id));
        }
    }
}

impl NodeMetricsSource for InMemoryGrid {
    fn executed_operations(&self, node: NodeId) -> u64 {
        self.metrics.executed_operations(node)
    }

    fn node_metrics(&self, node: NodeId) -> Option<NodeMetrics> {
        self.metrics.node_metrics(node)
    }
}
