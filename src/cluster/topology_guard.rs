//! Topology Guard: fail in-flight operations whose ownership assumptions broke.
//!
//! Every operation starts by capturing the assignment of the topology version
//! active at that moment ([`OperationContext`]). Before each step that touches
//! a partition the guard compares that partition's owners (primary first, then
//! backups) at the start version with the owners now. If the version moved and
//! the owners differ, the step fails with `TopologyLoss` instead of silently
//! retargeting another node.
//!
//! # Remote calls
//!
//! Calls to a primary race against a departure detector watching the topology.
//! If the primary leaves mid-call the call is dropped and converted into
//! `TopologyLoss`. Each attempt is bounded by `remote_call_timeout`; a timeout
//! counts as `NodeUnreachable`.
//!
//! `NodeUnreachable` is retried with backoff while the node is still live. Once
//! retries are exhausted the failure becomes `TopologyLoss` if the node has
//! departed in the meantime, or a fatal `Io` error otherwise.
//!
//! # Undoing writes
//!
//! Writes return the value they replaced. [`TopologyGuard::restore`] puts that
//! value back on the node that took the write, which lets a transaction undo
//! the writes it already applied when its commit aborts.
//!
//! # Operation counts
//!
//! Every call a primary completes is counted per node in the member's
//! [`OperationMetrics`], whatever transport carried it.
//!
//! # Single-key retry
//!
//! [`TopologyGuard::get`] and [`TopologyGuard::put`] may re-run once under the
//! new topology, as configured by `TopologyRetryPolicy`. Transactions never do.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use backon::Retryable;
use bytes::Bytes;
use tracing::{debug, warn};

use super::affinity::{AffinityEngine, Assignment};
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::metrics;
use super::operation_metrics::OperationMetrics;
use super::retry;
use super::traits::PrimaryTransport;
use crate::types::{NodeId, PartitionId, TopologyVersion};

/// Kind of operation being guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    Transaction,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Transaction => "transaction",
        }
    }
}

/// Topology an operation started under and the partitions it touched.
#[derive(Debug, Clone)]
pub struct OperationContext {
    kind: OperationKind,
    start: Arc<Assignment>,
    touched: BTreeSet<PartitionId>,
}

impl OperationContext {
    pub fn new(kind: OperationKind, start: Arc<Assignment>) -> Self {
        Self {
            kind,
            start,
            touched: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn start_version(&self) -> TopologyVersion {
        self.start.version()
    }

    /// Owners of a partition when the operation started.
    pub fn owners_at_start(&self, partition: PartitionId) -> &[NodeId] {
        self.start.owners(partition)
    }

    /// Record a partition for later validation without checking it now.
    pub fn touch(&mut self, partition: PartitionId) {
        self.touched.insert(partition);
    }

    pub fn touched(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.touched.iter().copied()
    }
}

/// Value read from a primary, with the owner and version it was validated at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryRead {
    pub value: Option<Bytes>,
    pub primary: NodeId,
    pub version: TopologyVersion,
}

/// Write applied by a primary, with the owner and version it was validated at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryWrite {
    pub primary: NodeId,
    pub partition: PartitionId,
    pub version: TopologyVersion,
    /// Value the write replaced on the primary.
    pub previous: Option<Bytes>,
}

/// Validates operations against topology changes and performs guarded calls.
pub struct TopologyGuard {
    engine: Arc<AffinityEngine>,
    transport: Arc<dyn PrimaryTransport>,
    operations: Arc<OperationMetrics>,
    config: ClusterConfig,
}

impl TopologyGuard {
    pub fn new(
        engine: Arc<AffinityEngine>,
        transport: Arc<dyn PrimaryTransport>,
        operations: Arc<OperationMetrics>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            engine,
            transport,
            operations,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<AffinityEngine> {
        &self.engine
    }

    /// Per-node counts of the calls this guard completed.
    pub fn operation_metrics(&self) -> &Arc<OperationMetrics> {
        &self.operations
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Start an operation under the current topology.
    pub fn begin(&self, kind: OperationKind) -> OperationContext {
        OperationContext::new(kind, self.engine.current())
    }

    /// Check that a partition's owners are unchanged since the operation started.
    ///
    /// Marks the partition as touched and returns its current owners. A
    /// partition without any owner is reported as topology loss.
    pub fn validate(
        &self,
        ctx: &mut OperationContext,
        partition: PartitionId,
    ) -> ClusterResult<Arc<Assignment>> {
        ctx.touched.insert(partition);
        let current = self.engine.current();
        let now = current.owners(partition);

        let changed = current.version() != ctx.start_version() && now != ctx.owners_at_start(partition);
        if changed || now.is_empty() {
            let err = ClusterError::topology_loss(partition, ctx.start_version(), current.version());
            metrics::record_topology_loss(ctx.kind.as_str());
            warn!(
                %partition,
                kind = ctx.kind.as_str(),
                started_at = %ctx.start_version(),
                current = %current.version(),
                owners_before = ?ctx.owners_at_start(partition),
                owners_now = ?now,
                "Topology loss detected"
            );
            return Err(err);
        }
        Ok(current)
    }

    /// Validate every partition the operation touched.
    pub fn validate_all(&self, ctx: &mut OperationContext) -> ClusterResult<()> {
        let touched: Vec<PartitionId> = ctx.touched().collect();
        for partition in touched {
            self.validate(ctx, partition)?;
        }
        Ok(())
    }

    /// Read a key from its primary within an operation.
    pub async fn read(&self, ctx: &mut OperationContext, key: Bytes) -> ClusterResult<PrimaryRead> {
        let partition = self.engine.partition(&key);
        let assignment = self.validate(ctx, partition)?;
        let primary = self.primary_of(&assignment, partition, ctx)?;

        let value = self
            .call_primary(ctx, partition, primary, "get", || {
                self.transport.get(primary, partition, key.clone())
            })
            .await?;
        self.operations.record_read(primary);

        // The value is only current if ownership survived the call.
        let assignment = self.validate(ctx, partition)?;
        Ok(PrimaryRead {
            value,
            primary,
            version: assignment.version(),
        })
    }

    /// Write a key to its primary within an operation.
    pub async fn write(
        &self,
        ctx: &mut OperationContext,
        key: Bytes,
        value: Bytes,
    ) -> ClusterResult<PrimaryWrite> {
        let mut write = self.write_through(ctx, key, value).await?;
        let assignment = self.validate(ctx, write.partition)?;
        write.version = assignment.version();
        Ok(write)
    }

    /// Write a key to its primary, checking ownership only before the call.
    ///
    /// The write has landed once this returns `Ok`, but it only counts as
    /// acknowledged after the caller validates the partition again.
    pub async fn write_through(
        &self,
        ctx: &mut OperationContext,
        key: Bytes,
        value: Bytes,
    ) -> ClusterResult<PrimaryWrite> {
        let partition = self.engine.partition(&key);
        let assignment = self.validate(ctx, partition)?;
        let primary = self.primary_of(&assignment, partition, ctx)?;

        let previous = self
            .call_primary(ctx, partition, primary, "put", || {
                self.transport
                    .put(primary, partition, key.clone(), value.clone())
            })
            .await?;
        self.operations.record_write(primary);

        Ok(PrimaryWrite {
            primary,
            partition,
            version: assignment.version(),
            previous,
        })
    }

    /// Put back the value a write replaced, on the node that took the write.
    ///
    /// Fails with `NodeDeparted` if that node has left, since nothing it holds
    /// is served any more. An unreachable node is retried while it stays live.
    pub async fn restore(&self, key: Bytes, write: &PrimaryWrite) -> ClusterResult<()> {
        let node = write.primary;
        let partition = write.partition;
        if !self.is_live(node) {
            return Err(ClusterError::NodeDeparted { node });
        }

        let undo = || async {
            let call = async {
                match &write.previous {
                    Some(value) => {
                        self.transport
                            .put(node, partition, key.clone(), value.clone())
                            .await
                    }
                    None => self.transport.remove(node, partition, key.clone()).await,
                }
            };
            match tokio::time::timeout(self.config.remote_call_timeout, call).await {
                Ok(res) => res.map(|_| ()),
                Err(_) => Err(ClusterError::NodeUnreachable {
                    node,
                    reason: format!("no response within {:?}", self.config.remote_call_timeout),
                }),
            }
        };

        let started = Instant::now();
        let result = retry::with_unreachable_policy(&self.config, undo, |e: &ClusterError| {
            e.is_retriable() && self.is_live(node)
        })
        .await;

        let result = match result {
            Ok(()) => {
                self.operations.record_write(node);
                Ok(())
            }
            Err(_) if !self.is_live(node) => Err(ClusterError::NodeDeparted { node }),
            Err(e) => Err(e),
        };
        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.as_metric_label(),
        };
        metrics::record_remote_call("restore", outcome, started.elapsed().as_secs_f64());
        result
    }

    /// Single-key read, re-run once under a new topology if so configured.
    pub async fn get(&self, key: Bytes) -> ClusterResult<PrimaryRead> {
        let mut retries = self.config.retry_policy.read.extra_attempts();
        loop {
            let mut ctx = self.begin(OperationKind::Read);
            match self.read(&mut ctx, key.clone()).await {
                Err(e) if e.is_topology_loss() && retries > 0 => {
                    retries -= 1;
                    debug!(error = %e, "Retrying read under new topology");
                }
                other => return other,
            }
        }
    }

    /// Single-key write, re-run once under a new topology if so configured.
    pub async fn put(&self, key: Bytes, value: Bytes) -> ClusterResult<PrimaryWrite> {
        let mut retries = self.config.retry_policy.write.extra_attempts();
        loop {
            let mut ctx = self.begin(OperationKind::Write);
            match self.write(&mut ctx, key.clone(), value.clone()).await {
                Err(e) if e.is_topology_loss() && retries > 0 => {
                    retries -= 1;
                    debug!(error = %e, "Retrying write under new topology");
                }
                other => return other,
            }
        }
    }

    fn primary_of(
        &self,
        assignment: &Assignment,
        partition: PartitionId,
        ctx: &OperationContext,
    ) -> ClusterResult<NodeId> {
        assignment.primary(partition).ok_or_else(|| {
            ClusterError::topology_loss(partition, ctx.start_version(), assignment.version())
        })
    }

    fn is_live(&self, node: NodeId) -> bool {
        self.engine.registry().current().contains(&node)
    }

    /// Resolve once `node` is no longer part of the topology.
    async fn departure(&self, node: NodeId) {
        let mut topology = self.engine.registry().subscribe();
        let departed = topology.wait_for(|s| !s.contains(&node)).await.is_ok();
        if !departed {
            std::future::pending::<()>().await;
        }
    }

    /// Call the primary with timeout, departure detection and bounded retries.
    async fn call_primary<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        partition: PartitionId,
        primary: NodeId,
        op: &'static str,
        call: F,
    ) -> ClusterResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        let started = Instant::now();
        let start_version = ctx.start_version();
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            attempts.fetch_add(1, Ordering::Relaxed);
            let attempt = async {
                tokio::select! {
                    biased;
                    _ = self.departure(primary) => Err(ClusterError::topology_loss(
                        partition,
                        start_version,
                        self.engine.registry().version(),
                    )),
                    res = call() => res,
                }
            };
            match tokio::time::timeout(self.config.remote_call_timeout, attempt).await {
                Ok(res) => res,
                Err(_) => Err(ClusterError::NodeUnreachable {
                    node: primary,
                    reason: format!("no response within {:?}", self.config.remote_call_timeout),
                }),
            }
        })
        .retry(retry::unreachable_policy(&self.config))
        .when(|e: &ClusterError| e.is_retriable() && self.is_live(primary))
        .notify(|e: &ClusterError, after| {
            debug!(node = %primary, error = %e, backoff_ms = after.as_millis() as u64, "Primary unreachable");
        })
        .await;

        let result = match result {
            Err(ClusterError::NodeUnreachable { reason, .. }) => {
                retry::record_retry_exhausted(op);
                if self.is_live(primary) {
                    Err(ClusterError::Io(format!(
                        "primary {} for partition {} unreachable: {}",
                        primary, partition, reason
                    )))
                } else {
                    metrics::record_topology_loss(ctx.kind.as_str());
                    Err(ClusterError::topology_loss(
                        partition,
                        start_version,
                        self.engine.registry().version(),
                    ))
                }
            }
            Err(e) => {
                if e.is_topology_loss() {
                    metrics::record_topology_loss(ctx.kind.as_str());
                    warn!(%partition, node = %primary, op, "Primary left during call");
                }
                Err(e)
            }
            Ok(value) => {
                let attempts = attempts.load(Ordering::Relaxed);
                if attempts > 1 {
                    retry::record_retry_attempt(op, attempts - 1);
                    retry::record_retry_success(op);
                }
                Ok(value)
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.as_metric_label(),
        };
        metrics::record_remote_call(op, outcome, started.elapsed().as_secs_f64());
        result
    }
}

impl std::fmt::Debug for TopologyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyGuard")
            .field("engine", &self.engine)
            .field("operations", &self.operations)
            .field("retry_policy", &self.config.retry_policy)
            .finish()
    }
}
