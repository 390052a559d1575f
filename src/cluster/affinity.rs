//! Affinity Function Engine: which nodes own which partitions.
//!
//! # Algorithm
//!
//! For every partition each live server node gets a rank: SipHash-2-4 (fixed
//! keys) over the partition id in little-endian bytes followed by the node id
//! bytes. Nodes are walked from the highest rank down, ties broken by node id.
//! The first node is the primary; the walk continues picking backups until
//! `backups + 1` nodes are selected or candidates run out.
//!
//! When an exclusion attribute is configured, a candidate is skipped if an
//! already selected node carries the same value for it. For `host-macs` the
//! value is a comma separated set of MAC addresses and two nodes conflict when
//! their sets share any address. Nodes without the attribute never conflict
//! with anyone.
//!
//! # Properties
//!
//! - Deterministic: the result depends only on the snapshot's member set and
//!   the configuration, never on local iteration order.
//! - Minimal disruption: a node's rank for a partition does not depend on the
//!   other nodes, so removing a node only changes partitions that selected it.
//! - Degraded redundancy: a partition may end up with fewer than `backups + 1`
//!   owners. That is a valid state, reported as `InsufficientReplicas` and
//!   logged, never an error.
//! - Client nodes are never candidates.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::Arc;

use dashmap::DashMap;
use siphasher::sip::SipHasher24;
use tracing::{debug, warn};

use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::metrics;
use super::topology::{TopologyRegistry, TopologySnapshot};
use crate::constants::{ATTR_HOST_MACS, MAX_PARTITIONS};
use crate::types::{NodeId, PartitionId, TopologyVersion};

/// Inputs of the affinity function besides the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityConfig {
    pub partitions: u32,
    pub backups: usize,
    pub exclusion_attribute: Option<String>,
}

impl AffinityConfig {
    pub fn new(partitions: u32, backups: usize) -> Self {
        Self {
            partitions,
            backups,
            exclusion_attribute: None,
        }
    }

    pub fn with_exclusion_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.exclusion_attribute = Some(attribute.into());
        self
    }

    /// Copies wanted per partition.
    #[inline]
    pub fn copies(&self) -> usize {
        self.backups + 1
    }
}

/// Map a key to its partition. Independent of topology.
pub fn partition_for_key(key: &[u8], partitions: u32) -> PartitionId {
    let mut hasher = SipHasher24::new();
    hasher.write(key);
    PartitionId((hasher.finish() % u64::from(partitions.max(1))) as u32)
}

/// Rank of a node for a partition. Higher ranks are preferred.
#[inline]
pub fn node_rank(partition: PartitionId, node: NodeId) -> u64 {
    let mut hasher = SipHasher24::new();
    hasher.write(&partition.value().to_le_bytes());
    hasher.write(node.as_bytes());
    hasher.finish()
}

/// Owners of every partition at one topology version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    version: TopologyVersion,
    backups: usize,
    owners: Vec<Vec<NodeId>>,
    degraded: usize,
}

impl Assignment {
    #[inline]
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    pub fn partition_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Requested backups per partition.
    pub fn backups(&self) -> usize {
        self.backups
    }

    /// Primary followed by backups. Empty for an unknown partition or a
    /// topology without servers.
    pub fn owners(&self, partition: PartitionId) -> &[NodeId] {
        self.owners
            .get(partition.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary(&self, partition: PartitionId) -> Option<NodeId> {
        self.owners(partition).first().copied()
    }

    pub fn backup_nodes(&self, partition: PartitionId) -> &[NodeId] {
        self.owners(partition).get(1..).unwrap_or(&[])
    }

    /// Number of partitions with fewer owners than requested.
    pub fn degraded_count(&self) -> usize {
        self.degraded
    }

    /// `InsufficientReplicas` describing a degraded partition, if it is one.
    pub fn insufficient_replicas(&self, partition: PartitionId) -> Option<ClusterError> {
        let available = self.owners(partition).len();
        let requested = self.backups + 1;
        (available < requested).then_some(ClusterError::InsufficientReplicas {
            partition,
            requested,
            available,
        })
    }

    /// Iterate partitions with their owners.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &[NodeId])> + '_ {
        self.owners
            .iter()
            .enumerate()
            .map(|(p, owners)| (PartitionId(p as u32), owners.as_slice()))
    }

    pub fn is_owner(&self, partition: PartitionId, node: NodeId) -> bool {
        self.owners(partition).contains(&node)
    }

    /// Partitions for which `node` is the primary.
    pub fn primary_partitions(&self, node: NodeId) -> Vec<PartitionId> {
        self.iter()
            .filter(|(_, owners)| owners.first() == Some(&node))
            .map(|(p, _)| p)
            .collect()
    }

    /// Partitions for which `node` holds a backup copy.
    pub fn backup_partitions(&self, node: NodeId) -> Vec<PartitionId> {
        self.iter()
            .filter(|(_, owners)| owners.iter().skip(1).any(|n| *n == node))
            .map(|(p, _)| p)
            .collect()
    }
}

/// Values under which a node is a neighbor of others for `attribute`.
///
/// Two nodes are neighbors when they share any of these values.
fn neighborhood<'a>(attribute: &str, value: &'a str) -> Vec<&'a str> {
    if attribute == ATTR_HOST_MACS {
        value
            .split(',')
            .map(str::trim)
            .filter(|mac| !mac.is_empty())
            .collect()
    } else {
        vec![value]
    }
}

/// Compute the assignment for a snapshot. Pure and deterministic.
pub fn assign(snapshot: &TopologySnapshot, config: &AffinityConfig) -> Assignment {
    let copies = config.copies();
    let candidates: Vec<(NodeId, Vec<&str>)> = snapshot
        .servers()
        .map(|n| {
            let groups = config
                .exclusion_attribute
                .as_deref()
                .and_then(|attr| n.attribute(attr).map(|value| neighborhood(attr, value)))
                .unwrap_or_default();
            (n.id(), groups)
        })
        .collect();

    let mut owners = Vec::with_capacity(config.partitions as usize);
    let mut degraded = 0;
    let mut ranked = Vec::with_capacity(candidates.len());

    for p in 0..config.partitions {
        let partition = PartitionId(p);

        ranked.clear();
        ranked.extend(
            candidates
                .iter()
                .map(|(id, groups)| (node_rank(partition, *id), *id, groups)),
        );
        ranked.sort_unstable_by_key(|(rank, id, _)| (Reverse(*rank), *id));

        let mut selected = Vec::with_capacity(copies.min(ranked.len()));
        let mut used_groups: HashSet<&str> = HashSet::new();
        for (_, id, groups) in &ranked {
            if selected.len() == copies {
                break;
            }
            if groups.iter().any(|g| used_groups.contains(g)) {
                continue;
            }
            used_groups.extend(groups.iter().copied());
            selected.push(*id);
        }

        if selected.len() < copies {
            degraded += 1;
        }
        owners.push(selected);
    }

    Assignment {
        version: snapshot.version(),
        backups: config.backups,
        owners,
        degraded,
    }
}

/// Computes and caches assignments per topology version.
///
/// Every version is computed at most once per engine (concurrent first
/// requests may race, but produce identical results).
pub struct AffinityEngine {
    config: AffinityConfig,
    registry: Arc<TopologyRegistry>,
    cache: DashMap<TopologyVersion, Arc<Assignment>>,
    cache_capacity: usize,
}

impl AffinityEngine {
    pub fn new(
        config: AffinityConfig,
        registry: Arc<TopologyRegistry>,
        cache_capacity: usize,
    ) -> ClusterResult<Self> {
        if config.partitions == 0 || config.partitions > MAX_PARTITIONS {
            return Err(ClusterError::Config(format!(
                "partitions ({}) must be between 1 and {}",
                config.partitions, MAX_PARTITIONS
            )));
        }
        Ok(Self {
            config,
            registry,
            cache: DashMap::new(),
            cache_capacity: cache_capacity.max(1),
        })
    }

    pub fn from_config(
        config: &ClusterConfig,
        registry: Arc<TopologyRegistry>,
    ) -> ClusterResult<Self> {
        Self::new(config.affinity(), registry, config.topology_history_capacity)
    }

    pub fn config(&self) -> &AffinityConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    pub fn partitions(&self) -> u32 {
        self.config.partitions
    }

    /// Partition a key belongs to.
    pub fn partition(&self, key: &[u8]) -> PartitionId {
        partition_for_key(key, self.config.partitions)
    }

    /// Assignment for a snapshot, computed once per version.
    pub fn assignment_for(&self, snapshot: &TopologySnapshot) -> Arc<Assignment> {
        let version = snapshot.version();
        if let Some(cached) = self.cache.get(&version) {
            return cached.value().clone();
        }

        let assignment = Arc::new(assign(snapshot, &self.config));
        metrics::record_assignment(assignment.degraded_count());
        if assignment.degraded_count() > 0 {
            warn!(
                %version,
                degraded = assignment.degraded_count(),
                partitions = self.config.partitions,
                requested_copies = self.config.copies(),
                servers = snapshot.server_count(),
                "Assignment has partitions with insufficient replicas"
            );
        } else {
            debug!(%version, servers = snapshot.server_count(), "Computed assignment");
        }

        self.cache.insert(version, assignment.clone());
        if let Some(stale) = version.value().checked_sub(self.cache_capacity as u64) {
            self.cache.retain(|v, _| v.value() > stale);
        }
        assignment
    }

    /// Assignment for the latest published version.
    pub fn current(&self) -> Arc<Assignment> {
        self.assignment_for(&self.registry.current())
    }

    /// Assignment for a specific version still held by the registry.
    pub fn assignment_at(&self, version: TopologyVersion) -> ClusterResult<Arc<Assignment>> {
        if let Some(cached) = self.cache.get(&version) {
            return Ok(cached.value().clone());
        }
        match self.registry.snapshot_at(version)? {
            Some(snapshot) => Ok(self.assignment_for(&snapshot)),
            None => Err(ClusterError::Config(format!(
                "topology {} has not been published",
                version
            ))),
        }
    }

    /// Primary node for a key in the current topology.
    pub fn map_key_to_node(&self, key: &[u8]) -> Option<NodeId> {
        self.current().primary(self.partition(key))
    }

    /// Primary followed by backups for a key in the current topology.
    pub fn map_key_to_primary_and_backups(&self, key: &[u8]) -> Vec<NodeId> {
        self.current().owners(self.partition(key)).to_vec()
    }

    pub fn is_primary_or_backup(&self, node: NodeId, key: &[u8]) -> bool {
        self.current().is_owner(self.partition(key), node)
    }

    pub fn primary_partitions(&self, node: NodeId) -> Vec<PartitionId> {
        self.current().primary_partitions(node)
    }

    pub fn backup_partitions(&self, node: NodeId) -> Vec<PartitionId> {
        self.current().backup_partitions(node)
    }
}

impl std::fmt::Debug for AffinityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityEngine")
            .field("config", &self.config)
            .field("cached_versions", &self.cache.len())
            .finish()
    }
}
