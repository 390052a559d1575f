//! Partition Assignment Planner.
//!
//! Turns a topology transition into per-partition movement plans for the
//! storage/rebalance collaborator, and tracks which plans are still in flight.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   versions   ┌──────────────────┐
//! │ TopologyRegistry │ ───────────▶ │  AffinityEngine  │
//! └──────────────────┘              └────────┬─────────┘
//!                                            │ old / new Assignment
//!                                            ▼
//!                                   ┌──────────────────┐   execute / cancel
//!                                   │ PartitionPlanner │ ───────────────────▶ MovementExecutor
//!                                   │  in-flight map   │ ◀─────────────────── acknowledge
//!                                   └──────────────────┘
//! ```
//!
//! # In-flight bookkeeping
//!
//! The in-flight map is the only shared mutable state of the planner. It is
//! written only while holding the planner's writer lock (planning and
//! acknowledgement) and may be read concurrently by [`PartitionPlanner::status`].
//! A new plan for a partition supersedes the in-flight one, which is cancelled
//! on the executor. Acknowledgements for superseded plans are ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::affinity::{AffinityEngine, Assignment};
use super::error::ClusterError;
use super::metrics;
use super::traits::MovementExecutor;
use crate::types::{NodeId, PartitionId, PlanId, TopologyVersion};

/// Owner changes of one partition between two assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionMovement {
    pub partition: PartitionId,
    /// Nodes that must receive a fresh copy.
    pub to_populate: Vec<NodeId>,
    /// Nodes that may discard their copy.
    pub to_drop: Vec<NodeId>,
    /// Previous owners to copy from, old primary first.
    pub sources: Vec<NodeId>,
}

/// A movement issued to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovementPlan {
    pub partition: PartitionId,
    pub plan_id: PlanId,
    pub from_version: TopologyVersion,
    pub to_version: TopologyVersion,
    pub to_populate: Vec<NodeId>,
    pub to_drop: Vec<NodeId>,
    pub sources: Vec<NodeId>,
}

/// Per-partition differences between two assignments.
///
/// Partitions whose owner set is unchanged are omitted. Order changes alone
/// (a backup promoted to primary) move no data and produce no entry.
pub fn compute_movements(old: &Assignment, new: &Assignment) -> Vec<PartitionMovement> {
    let partitions = old.partition_count().max(new.partition_count());
    let mut movements = Vec::new();

    for p in 0..partitions {
        let partition = PartitionId(p);
        let before = old.owners(partition);
        let after = new.owners(partition);

        let to_populate: Vec<NodeId> = after
            .iter()
            .copied()
            .filter(|n| !before.contains(n))
            .collect();
        let to_drop: Vec<NodeId> = before
            .iter()
            .copied()
            .filter(|n| !after.contains(n))
            .collect();

        if to_populate.is_empty() && to_drop.is_empty() {
            continue;
        }

        movements.push(PartitionMovement {
            partition,
            to_populate,
            to_drop,
            sources: before.to_vec(),
        });
    }

    movements
}

/// A plan issued to the executor and not yet acknowledged.
#[derive(Debug, Clone)]
struct InFlightPlan {
    plan_id: PlanId,
    to_version: TopologyVersion,
    issued_at: Instant,
}

/// Movement state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    /// No plan outstanding.
    Idle,
    /// A plan was issued and has not been acknowledged.
    InFlight {
        plan_id: PlanId,
        to_version: TopologyVersion,
    },
}

/// Planner statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerStats {
    pub issued: u64,
    pub superseded: u64,
    pub acknowledged: u64,
    pub stale_acks: u64,
    pub in_flight: usize,
}

/// Issues movement plans and tracks them until acknowledged.
pub struct PartitionPlanner {
    executor: Arc<dyn MovementExecutor>,
    in_flight: DashMap<PartitionId, InFlightPlan>,
    /// Serializes every mutation of `in_flight`.
    writer: Mutex<()>,
    next_plan_id: AtomicU64,
    issued: AtomicU64,
    superseded: AtomicU64,
    acknowledged: AtomicU64,
    stale_acks: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl PartitionPlanner {
    pub fn new(executor: Arc<dyn MovementExecutor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor,
            in_flight: DashMap::new(),
            writer: Mutex::new(()),
            next_plan_id: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            stale_acks: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Plan the transition from `old` to `new` and hand every plan to the executor.
    ///
    /// Returns the plans issued, one per partition whose owner set changed.
    pub async fn plan(&self, old: &Assignment, new: &Assignment) -> Vec<MovementPlan> {
        let movements = compute_movements(old, new);
        if movements.is_empty() {
            debug!(
                from = %old.version(),
                to = %new.version(),
                "Topology transition moves no partitions"
            );
            return Vec::new();
        }

        let _writer = self.writer.lock().await;
        let mut issued = Vec::with_capacity(movements.len());

        for movement in movements {
            let plan_id = PlanId(self.next_plan_id.fetch_add(1, Ordering::SeqCst) + 1);
            let plan = MovementPlan {
                partition: movement.partition,
                plan_id,
                from_version: old.version(),
                to_version: new.version(),
                to_populate: movement.to_populate,
                to_drop: movement.to_drop,
                sources: movement.sources,
            };

            let previous = self.in_flight.insert(
                plan.partition,
                InFlightPlan {
                    plan_id,
                    to_version: plan.to_version,
                    issued_at: Instant::now(),
                },
            );
            if let Some(previous) = previous {
                self.superseded.fetch_add(1, Ordering::Relaxed);
                metrics::record_movement_plan("superseded");
                info!(
                    partition = %plan.partition,
                    superseded = %previous.plan_id,
                    by = %plan_id,
                    age_ms = previous.issued_at.elapsed().as_millis() as u64,
                    "Superseding in-flight movement plan"
                );
                self.executor.cancel(plan.partition, previous.plan_id).await;
            }

            if let Err(e) = self.executor.execute(plan.clone()).await {
                error!(
                    partition = %plan.partition,
                    plan = %plan_id,
                    error = %e,
                    "Executor rejected movement plan"
                );
                self.in_flight.remove(&plan.partition);
                metrics::record_movement_plan("rejected");
                continue;
            }

            self.issued.fetch_add(1, Ordering::Relaxed);
            metrics::record_movement_plan("issued");
            issued.push(plan);
        }

        info!(
            from = %old.version(),
            to = %new.version(),
            plans = issued.len(),
            "Issued movement plans"
        );
        issued
    }

    /// Record completion of a plan.
    ///
    /// Returns `false` for an acknowledgement that does not match the plan
    /// currently in flight for the partition.
    pub async fn acknowledge(&self, partition: PartitionId, plan_id: PlanId) -> bool {
        let _writer = self.writer.lock().await;
        let matches = self
            .in_flight
            .get(&partition)
            .is_some_and(|p| p.plan_id == plan_id);

        if matches {
            self.in_flight.remove(&partition);
            self.acknowledged.fetch_add(1, Ordering::Relaxed);
            metrics::record_movement_plan("acknowledged");
            debug!(%partition, plan = %plan_id, "Movement plan acknowledged");
        } else {
            self.stale_acks.fetch_add(1, Ordering::Relaxed);
            metrics::record_movement_plan("stale_ack");
            debug!(%partition, plan = %plan_id, "Ignoring acknowledgement for stale plan");
        }
        matches
    }

    /// Movement state of a partition.
    pub fn status(&self, partition: PartitionId) -> PlanStatus {
        match self.in_flight.get(&partition) {
            Some(p) => PlanStatus::InFlight {
                plan_id: p.plan_id,
                to_version: p.to_version,
            },
            None => PlanStatus::Idle,
        }
    }

    /// Partitions with an outstanding plan, sorted.
    pub fn in_flight_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.in_flight.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn stats(&self) -> PlannerStats {
        PlannerStats {
            issued: self.issued.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            stale_acks: self.stale_acks.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }

    /// Follow the registry and plan every published transition in order.
    pub fn start(self: &Arc<Self>, engine: Arc<AffinityEngine>) -> JoinHandle<()> {
        let planner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let registry = Arc::clone(engine.registry());
        let mut topology = registry.subscribe();
        // Versions published from here on are planned by the task.
        let mut previous = engine.assignment_for(&topology.borrow_and_update());

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = topology.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }

                let snapshots = match registry.snapshots_since(previous.version()) {
                    Ok(snapshots) => snapshots,
                    Err(ClusterError::HistoryPruned { version }) => {
                        warn!(
                            %version,
                            "Planner fell behind retained topology history, planning against latest"
                        );
                        vec![registry.current()]
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to replay topology versions");
                        continue;
                    }
                };

                for snapshot in snapshots {
                    let next = engine.assignment_for(&snapshot);
                    planner.plan(&previous, &next).await;
                    previous = next;
                }
            }
            info!("Partition planner stopped");
        })
    }

    /// Stop the loop started by [`PartitionPlanner::start`].
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for PartitionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionPlanner")
            .field("stats", &self.stats())
            .finish()
    }
}
