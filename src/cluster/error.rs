//! Error types for the grid core.
//!
//! # Error Taxonomy
//!
//! | Error                  | Where it is resolved                                   |
//! |------------------------|--------------------------------------------------------|
//! | `TopologyLoss`         | Always surfaced to the caller                          |
//! | `InsufficientReplicas` | Degraded state; logged as a warning, never fails an op |
//! | `StaleRead`            | Near cache, by forcing a read-through                  |
//! | `NodeUnreachable`      | Retried locally with backoff, then escalated           |
//!
//! # Escalation of unreachable primaries
//!
//! A `NodeUnreachable` failure is retried while the node is still part of the
//! current topology. Once the retry budget is exhausted the error becomes
//! `TopologyLoss` if the node has since departed, or a fatal `Io` error if it
//! is still listed as live.
//!
//! # Guidelines
//!
//! - **Read path**: never return a stale value labeled as current
//! - **Write path**: never report success for a write whose owner changed
//! - **Transactions**: abort on topology loss, the caller decides on retry

use thiserror::Error;

use crate::types::{NodeId, PartitionId, TopologyVersion};

/// Result type for grid operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors produced by the grid core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// The nodes owning a partition changed while an operation was in flight.
    #[error(
        "Topology lost for partition {partition}: operation started at {started_at}, topology is now {current}"
    )]
    TopologyLoss {
        partition: PartitionId,
        started_at: TopologyVersion,
        current: TopologyVersion,
    },

    /// Requested redundancy cannot be met by the live nodes.
    ///
    /// Reported as a degraded assignment rather than a failure.
    #[error(
        "Insufficient replicas for partition {partition}: requested {requested}, available {available}"
    )]
    InsufficientReplicas {
        partition: PartitionId,
        requested: usize,
        available: usize,
    },

    /// A near-cache entry was recorded under an older topology version.
    #[error("Stale read for partition {partition}: entry at {entry_version}, topology at {current}")]
    StaleRead {
        partition: PartitionId,
        entry_version: TopologyVersion,
        current: TopologyVersion,
    },

    /// Transient failure talking to a node that is still part of the topology.
    #[error("Node {node} unreachable: {reason}")]
    NodeUnreachable { node: NodeId, reason: String },

    /// The node is not part of the current topology, so a call to it was not attempted.
    #[error("Node {node} has left the topology")]
    NodeDeparted { node: NodeId },

    /// A node identity was admitted twice.
    #[error("Node {node} was already admitted; a rejoining node needs a new identity")]
    DuplicateNode { node: NodeId },

    /// A node attribute key outside the recognized set.
    #[error("Unknown node attribute key '{key}'")]
    UnknownAttribute { key: String },

    /// The topology version has been dropped from the retained history.
    #[error("Topology {version} is no longer retained")]
    HistoryPruned { version: TopologyVersion },

    /// Operation attempted on a transaction that already finished.
    #[error("Transaction is {state}")]
    TransactionClosed { state: &'static str },

    /// Fatal I/O failure against a node that is still live.
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Build a topology loss error.
    pub fn topology_loss(
        partition: PartitionId,
        started_at: TopologyVersion,
        current: TopologyVersion,
    ) -> Self {
        ClusterError::TopologyLoss {
            partition,
            started_at,
            current,
        }
    }

    /// Check if this error means the owning nodes changed mid-operation.
    #[inline]
    pub fn is_topology_loss(&self) -> bool {
        matches!(self, ClusterError::TopologyLoss { .. })
    }

    /// Check if this error is retriable (transient network issue).
    ///
    /// Only an unreachable-but-still-live node qualifies. Topology loss is not
    /// retriable at this level; the caller decides.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClusterError::NodeUnreachable { .. })
    }

    /// Check if the condition is resolved inside the grid without caller involvement.
    #[inline]
    pub fn is_recoverable_locally(&self) -> bool {
        matches!(
            self,
            ClusterError::StaleRead { .. } | ClusterError::NodeUnreachable { .. }
        )
    }

    /// Label used for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ClusterError::TopologyLoss { .. } => "topology_loss",
            ClusterError::InsufficientReplicas { .. } => "insufficient_replicas",
            ClusterError::StaleRead { .. } => "stale_read",
            ClusterError::NodeUnreachable { .. } => "node_unreachable",
            ClusterError::NodeDeparted { .. } => "node_departed",
            ClusterError::DuplicateNode { .. } => "duplicate_node",
            ClusterError::UnknownAttribute { .. } => "unknown_attribute",
            ClusterError::HistoryPruned { .. } => "history_pruned",
            ClusterError::TransactionClosed { .. } => "transaction_closed",
            ClusterError::Io(_) => "io",
            ClusterError::Config(_) => "config",
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(e.to_string())
    }
}
