//! Client-facing operation API and the wiring of one grid member.
//!
//! [`Grid`] assembles the registry, affinity engine, planner and topology
//! guard of a member from a [`ClusterConfig`]. [`GridClient`] is what
//! application code talks to: `get`, `put`, `local_peek` and transactions,
//! optionally through a near cache.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gridaffinity::cluster::{
//!     ClusterConfig, ClusterProfile, Grid, InMemoryGrid, NodeSpec, TxConcurrency, TxIsolation,
//! };
//! use gridaffinity::types::NodeId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(InMemoryGrid::new());
//!     let config = ClusterConfig::from_profile(ClusterProfile::Production);
//!     let grid = Grid::new(config, backend.clone(), backend)?;
//!
//!     grid.registry().join(NodeSpec::server(NodeId::random())).await?;
//!
//!     let client = grid.near_client();
//!     client.put("greeting", "hello").await?;
//!     assert_eq!(client.get("greeting").await?.as_deref(), Some(&b"hello"[..]));
//!
//!     let mut tx = client.tx_start(TxConcurrency::Optimistic, TxIsolation::RepeatableRead);
//!     tx.put("counter", "1").await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::info;

use super::affinity::AffinityEngine;
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::near_cache::NearCache;
use super::operation_metrics::OperationMetrics;
use super::planner::PartitionPlanner;
use super::topology::TopologyRegistry;
use super::topology_guard::TopologyGuard;
use super::traits::{MovementExecutor, PrimaryTransport};
use super::transaction::{Transaction, TxConcurrency, TxIsolation};

/// The components of one grid member.
pub struct Grid {
    config: ClusterConfig,
    registry: Arc<TopologyRegistry>,
    engine: Arc<AffinityEngine>,
    planner: Arc<PartitionPlanner>,
    guard: Arc<TopologyGuard>,
}

impl Grid {
    /// Validate the configuration and wire the components together.
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn PrimaryTransport>,
        executor: Arc<dyn MovementExecutor>,
    ) -> ClusterResult<Self> {
        config.validate().map_err(|errors| {
            ClusterError::Config(format!(
                "Configuration validation failed: {}",
                errors.join("; ")
            ))
        })?;

        let registry = Arc::new(TopologyRegistry::from_config(&config));
        let engine = Arc::new(AffinityEngine::from_config(&config, registry.clone())?);
        let planner = Arc::new(PartitionPlanner::new(executor));
        let guard = Arc::new(TopologyGuard::new(
            engine.clone(),
            transport,
            Arc::new(OperationMetrics::new()),
            config.clone(),
        ));

        info!(
            partitions = config.partitions,
            backups = config.backups,
            exclusion_attribute = ?config.exclusion_attribute,
            read_retry = %config.retry_policy.read,
            write_retry = %config.retry_policy.write,
            "Grid member initialized"
        );

        Ok(Self {
            config,
            registry,
            engine,
            planner,
            guard,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<AffinityEngine> {
        &self.engine
    }

    pub fn planner(&self) -> &Arc<PartitionPlanner> {
        &self.planner
    }

    pub fn guard(&self) -> &Arc<TopologyGuard> {
        &self.guard
    }

    /// Operations this member completed against each primary.
    pub fn operation_metrics(&self) -> &Arc<OperationMetrics> {
        self.guard.operation_metrics()
    }

    /// Start planning movements for every published topology change.
    pub fn start_planner(&self) -> JoinHandle<()> {
        self.planner.start(self.engine.clone())
    }

    /// Client that always goes to the primary.
    pub fn client(&self) -> GridClient {
        GridClient::new(self.guard.clone())
    }

    /// Client with a near cache in front of the primaries.
    pub fn near_client(&self) -> GridClient {
        GridClient::with_near_cache(self.guard.clone())
    }
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .field("planner", &self.planner)
            .finish()
    }
}

/// Application-facing key/value and transaction API.
#[derive(Debug)]
pub struct GridClient {
    guard: Arc<TopologyGuard>,
    near_cache: Option<NearCache>,
}

impl GridClient {
    pub fn new(guard: Arc<TopologyGuard>) -> Self {
        Self {
            guard,
            near_cache: None,
        }
    }

    pub fn with_near_cache(guard: Arc<TopologyGuard>) -> Self {
        let near_cache = NearCache::new(guard.clone());
        Self {
            guard,
            near_cache: Some(near_cache),
        }
    }

    pub fn near_cache(&self) -> Option<&NearCache> {
        self.near_cache.as_ref()
    }

    pub fn affinity(&self) -> &Arc<AffinityEngine> {
        self.guard.engine()
    }

    pub async fn get(&self, key: impl Into<Bytes>) -> ClusterResult<Option<Bytes>> {
        match &self.near_cache {
            Some(cache) => cache.get(key).await,
            None => Ok(self.guard.get(key.into()).await?.value),
        }
    }

    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> ClusterResult<()> {
        match &self.near_cache {
            Some(cache) => cache.put(key, value).await,
            None => self.guard.put(key.into(), value.into()).await.map(|_| ()),
        }
    }

    /// Locally cached value, without contacting any node.
    ///
    /// Always `None` for a client without a near cache.
    pub fn local_peek(&self, key: &[u8]) -> Option<Bytes> {
        self.near_cache.as_ref().and_then(|c| c.local_peek(key))
    }

    pub fn tx_start(&self, concurrency: TxConcurrency, isolation: TxIsolation) -> Transaction {
        Transaction::begin(self.guard.clone(), concurrency, isolation)
    }
}
