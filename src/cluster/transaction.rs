//! Transactions guarded against topology change.
//!
//! | Concurrency | Ownership checked | Writes |
//! |-------------|-------------------|--------|
//! | Pessimistic | at every `get`/`put` and again at commit | buffered, written at commit |
//! | Optimistic | at reads and at commit | buffered, written at commit |
//!
//! A commit validates every touched partition, writes each buffered value to
//! its primary, then validates again. If anything fails part-way, the values
//! the applied writes replaced are put back before the transaction reports
//! `RolledBack`. When a replaced value cannot be put back the transaction ends
//! `Indeterminate` instead.
//!
//! Isolation is repeatable read: a key read once returns the same value for
//! the rest of the transaction, and a key written returns the written value.
//!
//! Topology loss on any touched partition aborts the transaction. It is never
//! retried here; the caller decides whether to start a new transaction against
//! the new topology.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::error::{ClusterError, ClusterResult};
use super::metrics;
use super::topology_guard::{OperationContext, OperationKind, PrimaryWrite, TopologyGuard};
use crate::types::TopologyVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxConcurrency {
    Optimistic,
    Pessimistic,
}

impl TxConcurrency {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxConcurrency::Optimistic => "optimistic",
            TxConcurrency::Pessimistic => "pessimistic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxIsolation {
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
    /// A commit aborted and some of its writes could not be undone.
    Indeterminate,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
            TxState::Indeterminate => "indeterminate",
        }
    }
}

/// A transaction over grid keys.
pub struct Transaction {
    guard: Arc<TopologyGuard>,
    concurrency: TxConcurrency,
    isolation: TxIsolation,
    ctx: OperationContext,
    reads: HashMap<Bytes, Option<Bytes>>,
    writes: BTreeMap<Bytes, Bytes>,
    state: TxState,
}

impl Transaction {
    pub(crate) fn begin(
        guard: Arc<TopologyGuard>,
        concurrency: TxConcurrency,
        isolation: TxIsolation,
    ) -> Self {
        let ctx = guard.begin(OperationKind::Transaction);
        debug!(
            concurrency = concurrency.as_str(),
            version = %ctx.start_version(),
            "Transaction started"
        );
        Self {
            guard,
            concurrency,
            isolation,
            ctx,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            state: TxState::Active,
        }
    }

    pub fn concurrency(&self) -> TxConcurrency {
        self.concurrency
    }

    pub fn isolation(&self) -> TxIsolation {
        self.isolation
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Topology version the transaction started under.
    pub fn start_version(&self) -> TopologyVersion {
        self.ctx.start_version()
    }

    pub async fn get(&mut self, key: impl Into<Bytes>) -> ClusterResult<Option<Bytes>> {
        self.ensure_active()?;
        let key = key.into();

        if self.concurrency == TxConcurrency::Pessimistic {
            let partition = self.guard.engine().partition(&key);
            let checked = self.guard.validate(&mut self.ctx, partition);
            self.abort_on_error(checked)?;
        }

        if let Some(value) = self.writes.get(&key) {
            return Ok(Some(value.clone()));
        }
        if let Some(value) = self.reads.get(&key) {
            return Ok(value.clone());
        }

        let read = self.guard.read(&mut self.ctx, key.clone()).await;
        let read = self.abort_on_error(read)?;
        self.reads.insert(key, read.value.clone());
        Ok(read.value)
    }

    pub async fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> ClusterResult<()> {
        self.ensure_active()?;
        let key = key.into();
        let partition = self.guard.engine().partition(&key);

        match self.concurrency {
            TxConcurrency::Pessimistic => {
                let checked = self.guard.validate(&mut self.ctx, partition);
                self.abort_on_error(checked)?;
            }
            TxConcurrency::Optimistic => self.ctx.touch(partition),
        }

        self.writes.insert(key, value.into());
        Ok(())
    }

    /// Validate every touched partition, then write buffered values to their primaries.
    ///
    /// An abort after some writes landed undoes them before returning.
    pub async fn commit(&mut self) -> ClusterResult<()> {
        self.ensure_active()?;

        let checked = self.guard.validate_all(&mut self.ctx);
        self.abort_on_error(checked)?;

        let writes = std::mem::take(&mut self.writes);
        let mut applied: Vec<(Bytes, PrimaryWrite)> = Vec::with_capacity(writes.len());
        let mut outcome = Ok(());
        for (key, value) in writes {
            match self.guard.write_through(&mut self.ctx, key.clone(), value).await {
                Ok(write) => applied.push((key, write)),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        // Ownership must have held for the whole commit, not just up to each write.
        if outcome.is_ok() {
            outcome = self.guard.validate_all(&mut self.ctx);
        }

        if let Err(e) = outcome {
            let undone = self.undo(&applied).await;
            let result = self.abort_on_error(Err(e));
            if !undone {
                self.state = TxState::Indeterminate;
            }
            return result;
        }

        self.state = TxState::Committed;
        metrics::record_transaction(self.concurrency.as_str(), "committed");
        debug!(
            concurrency = self.concurrency.as_str(),
            version = %self.ctx.start_version(),
            "Transaction committed"
        );
        Ok(())
    }

    pub fn rollback(&mut self) -> ClusterResult<()> {
        self.ensure_active()?;
        self.finish_rollback("rolled_back");
        Ok(())
    }

    fn ensure_active(&self) -> ClusterResult<()> {
        match self.state {
            TxState::Active => Ok(()),
            state => Err(ClusterError::TransactionClosed {
                state: state.as_str(),
            }),
        }
    }

    fn abort_on_error<T>(&mut self, result: ClusterResult<T>) -> ClusterResult<T> {
        if let Err(e) = &result {
            info!(
                concurrency = self.concurrency.as_str(),
                started_at = %self.ctx.start_version(),
                error = %e,
                "Transaction aborted"
            );
            self.finish_rollback(e.as_metric_label());
        }
        result
    }

    /// Put back what the applied writes replaced, newest first.
    ///
    /// Returns `false` if any key could not be restored.
    async fn undo(&self, applied: &[(Bytes, PrimaryWrite)]) -> bool {
        let mut undone = true;
        for (key, write) in applied.iter().rev() {
            if let Err(e) = self.guard.restore(key.clone(), write).await {
                warn!(
                    node = %write.primary,
                    partition = %write.partition,
                    error = %e,
                    "Could not undo write of aborted commit"
                );
                undone = false;
            }
        }
        undone
    }

    fn finish_rollback(&mut self, outcome: &str) {
        self.writes.clear();
        self.reads.clear();
        self.state = TxState::RolledBack;
        metrics::record_transaction(self.concurrency.as_str(), outcome);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            debug!(
                concurrency = self.concurrency.as_str(),
                "Rolling back transaction dropped while active"
            );
            self.finish_rollback("dropped");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("concurrency", &self.concurrency)
            .field("isolation", &self.isolation)
            .field("state", &self.state)
            .field("start_version", &self.ctx.start_version())
            .field("buffered_writes", &self.writes.len())
            .finish()
    }
}
