//! Type-safe wrappers for grid identity and versioning primitives.
//!
//! These newtypes keep node identities, join orders, topology versions and
//! partition numbers from being mixed up even though several of them share
//! the same underlying integer representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, cluster-unique node identity.
///
/// A node that leaves and later rejoins is admitted under a fresh `NodeId`;
/// identities are never reused across a departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node identity.
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    /// Build an identity from a fixed 128-bit value (useful for reproducible tests).
    #[inline]
    pub const fn from_u128(value: u128) -> Self {
        NodeId(Uuid::from_u128(value))
    }

    /// Raw bytes of the identity, used as stable hash input.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for NodeId {
    fn from(value: Uuid) -> Self {
        NodeId(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Admission order of a node.
///
/// Assigned exclusively by the topology registry from an atomically incremented
/// sequence. The first admitted node has order 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct JoinOrder(pub u64);

impl JoinOrder {
    #[inline]
    pub const fn new(value: u64) -> Self {
        JoinOrder(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JoinOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing topology version.
///
/// Version 0 is the empty topology that exists before any node has joined.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TopologyVersion(pub u64);

impl TopologyVersion {
    /// The empty topology published when the registry is created.
    pub const INITIAL: Self = TopologyVersion(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        TopologyVersion(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version that directly follows this one.
    #[inline]
    pub const fn next(self) -> Self {
        TopologyVersion(self.0 + 1)
    }
}

impl From<u64> for TopologyVersion {
    fn from(value: u64) -> Self {
        TopologyVersion(value)
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Logical shard number in `[0, partitions)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PartitionId(pub u32);

impl PartitionId {
    #[inline]
    pub const fn new(value: u32) -> Self {
        PartitionId(value)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Index into per-partition vectors.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a movement plan issued by the partition assignment planner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PlanId(pub u64);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan-{}", self.0)
    }
}
