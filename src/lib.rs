//! # Gridaffinity
//! Partition affinity, topology versioning and near-cache consistency for an
//! in-memory data grid.
//!
//! A grid spreads its key space over a fixed number of partitions and each
//! partition over a primary and a configurable number of backups. This crate
//! is the core that decides those owners, keeps the decision stable while nodes
//! come and go, and stops clients from reading or writing through an ownership
//! picture that no longer holds.
//!
//! # Goals
//! - Deterministic placement: every member computes the same owners from the same topology
//! - Minimal disruption: a membership change only moves partitions it has to
//! - No silent retargeting: operations that lose their owner fail with `TopologyLoss`
//! - Leverage [Tokio](https://tokio.rs/) for everything asynchronous
//!
//! ## Getting started
//! Include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! gridaffinity = "0.1"
//! ```
//!
//! ### Mapping keys to nodes
//! ```rust,no_run
//! use gridaffinity::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::from_profile(ClusterProfile::Production)
//!         .with_backups(2)
//!         .with_exclusion_attribute(gridaffinity::constants::ATTR_HOST_MACS);
//!     let backend = Arc::new(InMemoryGrid::new());
//!     let grid = Grid::new(config, backend.clone(), backend)?;
//!
//!     for host in ["aa:01", "aa:02", "aa:03"] {
//!         let attributes = NodeAttributes::new().with("host-macs", host)?;
//!         grid.registry()
//!             .join(NodeSpec::server(NodeId::random()).with_attributes(attributes))
//!             .await?;
//!     }
//!
//!     let owners = grid.engine().map_key_to_primary_and_backups(b"order:7");
//!     assert_eq!(owners.len(), 3);
//!     Ok(())
//! }
//! ```
//!
//! See [`cluster`] for the component overview.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main export of grid structures
    //!
    //! ## Example
    //! ```rust,no_run
    //! use gridaffinity::prelude::*;
    //! use std::sync::Arc;
    //!
    //! #[tokio::main]
    //! async fn main() {
    //!     let backend = Arc::new(InMemoryGrid::new());
    //!     let config = ClusterConfig::from_profile(ClusterProfile::Development);
    //!     let grid = Grid::new(config, backend.clone(), backend).unwrap();
    //!     grid.registry().join(NodeSpec::server(NodeId::random())).await.unwrap();
    //!
    //!     let client = grid.client();
    //!     client.put("k", "v").await.unwrap();
    //! }
    //! ```
    pub use crate::cluster::{
        AffinityEngine, ClusterConfig, ClusterError, ClusterProfile, ClusterResult, DiscoveryEvent,
        Grid, GridClient, InMemoryGrid, NodeAttributes, NodeRole, NodeSpec, RetryMode,
        TopologyRegistry, TopologyRetryPolicy, Transaction, TxConcurrency, TxIsolation,
    };
    pub use crate::types::{JoinOrder, NodeId, PartitionId, PlanId, TopologyVersion};

    pub use bytes;
}
