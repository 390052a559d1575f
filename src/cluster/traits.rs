//! Seams between the grid core and its external collaborators.
//!
//! The core decides *who* owns data and *when* an operation is still valid. It
//! does not move bytes over the network, persist partitions or aggregate
//! metrics itself. Those jobs belong to implementations of the traits below.
//!
//! # Available Implementations
//!
//! - [`InMemoryGrid`](super::in_memory::InMemoryGrid): loopback implementation of
//!   every trait, with fault injection, used by tests and demos
//!
//! # Trait Hierarchy
//!
//! - [`PrimaryTransport`]: read-through / write-through against a partition primary
//! - [`MovementExecutor`]: storage/rebalance collaborator that executes movement plans
//! - [`NodeMetricsSource`]: per-node executed operation counters

use async_trait::async_trait;
use bytes::Bytes;

use super::error::ClusterResult;
use super::operation_metrics::NodeMetrics;
use super::planner::MovementPlan;
use crate::types::{NodeId, PartitionId, PlanId};

/// Calls against the node currently acting as primary for a partition.
///
/// Implementations report a transient failure to reach a node that is still
/// live as `ClusterError::NodeUnreachable`. The topology guard decides whether
/// to retry, abort or escalate.
#[async_trait]
pub trait PrimaryTransport: Send + Sync {
    /// Read a key from the primary.
    async fn get(
        &self,
        node: NodeId,
        partition: PartitionId,
        key: Bytes,
    ) -> ClusterResult<Option<Bytes>>;

    /// Write a key to the primary, returning the value it replaced.
    async fn put(
        &self,
        node: NodeId,
        partition: PartitionId,
        key: Bytes,
        value: Bytes,
    ) -> ClusterResult<Option<Bytes>>;

    /// Remove a key from the primary, returning the value it held.
    ///
    /// Used to undo a write whose key did not exist before.
    async fn remove(
        &self,
        node: NodeId,
        partition: PartitionId,
        key: Bytes,
    ) -> ClusterResult<Option<Bytes>>;
}

/// Storage/rebalance collaborator that moves partition copies.
///
/// `execute` only hands the plan over. Completion is reported back later
/// through `PartitionPlanner::acknowledge`.
#[async_trait]
pub trait MovementExecutor: Send + Sync {
    /// Start executing a movement plan.
    async fn execute(&self, plan: MovementPlan) -> Result<(), String>;

    /// Abandon a plan that a newer plan for the same partition replaced.
    async fn cancel(&self, partition: PartitionId, plan_id: PlanId);
}

/// Read-only access to per-node operation counters.
pub trait NodeMetricsSource: Send + Sync {
    /// Operations executed by `node` for partitions it owns, since startup.
    fn executed_operations(&self, node: NodeId) -> u64;

    /// Full counter set for a node, if the node is known.
    fn node_metrics(&self, node: NodeId) -> Option<NodeMetrics>;
}
