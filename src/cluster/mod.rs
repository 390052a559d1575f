//! Partition affinity and topology consistency for a distributed in-memory grid.
//!
//! This module decides which node owns which slice of the key space, keeps that
//! decision stable as nodes join and leave, and makes sure clients never act on
//! an ownership picture that has silently gone out of date.
//!
//! # Architecture
//!
//! ```text
//!   discovery events
//!          │
//!          ▼
//!  ┌──────────────────┐   versioned snapshots   ┌──────────────────┐
//!  │ TopologyRegistry │ ──────────────────────▶ │  AffinityEngine  │
//!  └──────────────────┘                         └────────┬─────────┘
//!          │                                             │ assignments
//!          │                     ┌───────────────────────┼──────────────────┐
//!          │                     ▼                       ▼                  ▼
//!          │           ┌──────────────────┐    ┌──────────────────┐  ┌────────────┐
//!          └─────────▶ │  TopologyGuard   │    │ PartitionPlanner │  │ GridClient │
//!                      └────────┬─────────┘    └────────┬─────────┘  └─────┬──────┘
//!                               │                       │                  │
//!                               ▼                       ▼                  ▼
//!                      PrimaryTransport        MovementExecutor      NearCache /
//!                                                                    Transaction
//! ```
//!
//! - **Topology Registry**: ordered, versioned membership; one published snapshot per change
//! - **Affinity Engine**: rendezvous hashing of partitions onto server nodes,
//!   with optional exclusion of copies that share an attribute value
//! - **Partition Planner**: movement plans between consecutive assignments
//! - **Topology Guard**: fails operations whose owners changed under them
//! - **Near Cache**: client-side cache invalidated by topology changes
//! - **Transactions**: optimistic and pessimistic, aborted on topology loss
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gridaffinity::cluster::{ClusterConfig, Grid, InMemoryGrid, NodeSpec};
//! use gridaffinity::types::NodeId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::from_env()?;
//!     let backend = Arc::new(InMemoryGrid::applying_plans());
//!     let grid = Grid::new(config, backend.clone(), backend)?;
//!     let _planner = grid.start_planner();
//!
//!     grid.registry().join(NodeSpec::server(NodeId::random())).await?;
//!     let owners = grid.engine().map_key_to_primary_and_backups(b"user:42");
//!     println!("user:42 lives on {:?}", owners);
//!     Ok(())
//! }
//! ```

pub mod affinity;
mod client;
mod config;
mod error;
pub mod in_memory;
pub mod metrics;
pub mod near_cache;
mod node;
pub mod operation_metrics;
pub mod planner;
pub mod retry;
pub mod topology;
pub mod topology_guard;
mod traits;
pub mod transaction;

pub use affinity::{
    AffinityConfig, AffinityEngine, Assignment, assign, node_rank, partition_for_key,
};
pub use client::{Grid, GridClient};
pub use config::{ClusterConfig, ClusterProfile, RetryMode, TopologyRetryPolicy};
pub use error::{ClusterError, ClusterResult};
pub use in_memory::InMemoryGrid;
pub use near_cache::{EntryState, NearCache};
pub use node::{DiscoveryEvent, Node, NodeAttributes, NodeRole, NodeSpec};
pub use operation_metrics::{ClusterMetricsSnapshot, NodeMetrics, OperationMetrics};
pub use planner::{
    MovementPlan, PartitionMovement, PartitionPlanner, PlanStatus, PlannerStats,
    compute_movements,
};
pub use topology::{NodeTable, TopologyRegistry, TopologySnapshot};
pub use topology_guard::{
    OperationContext, OperationKind, PrimaryRead, PrimaryWrite, TopologyGuard,
};
pub use traits::{MovementExecutor, NodeMetricsSource, PrimaryTransport};
pub use transaction::{Transaction, TxConcurrency, TxIsolation, TxState};
