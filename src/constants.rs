//! Centralized configuration constants.
//!
//! This module consolidates the defaults and well-known names used throughout
//! the grid core so that they are documented and updated in one place.
//!
//! # Categories
//!
//! - **Partitioning Constants**: partition count and redundancy defaults
//! - **Attribute Keys**: the fixed set of node attribute keys the grid understands
//! - **Topology Constants**: version history retention
//! - **Remote Call Constants**: timeouts and retry bounds for primary calls

// =============================================================================
// Partitioning Constants
// =============================================================================

/// Default number of partitions for a new cluster.
///
/// Fixed for the lifetime of a cluster; changing it remaps every key.
pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Upper bound on the configured partition count.
pub const MAX_PARTITIONS: u32 = 65_536;

/// Default number of backup copies per partition (in addition to the primary).
pub const DEFAULT_BACKUPS: usize = 1;

/// Upper bound on the configured backup count.
pub const MAX_BACKUPS: usize = 16;

// =============================================================================
// Attribute Keys
// =============================================================================
//
// Node attributes are a fixed string-to-string mapping. Only the keys below are
// accepted; anything else is rejected when the node is constructed.

/// Logical placement group (for example a physical host or chassis).
pub const ATTR_PLACEMENT_GROUP: &str = "placement-group";

/// Comma separated MAC addresses of the host. Nodes whose sets share any
/// address run on the same physical machine.
pub const ATTR_HOST_MACS: &str = "host-macs";

/// Rack identifier.
pub const ATTR_RACK: &str = "rack";

/// Data center identifier.
pub const ATTR_DATA_CENTER: &str = "data-center";

/// Every attribute key a node may carry.
pub const RECOGNIZED_ATTRIBUTE_KEYS: &[&str] = &[
    ATTR_PLACEMENT_GROUP,
    ATTR_HOST_MACS,
    ATTR_RACK,
    ATTR_DATA_CENTER,
];

// =============================================================================
// Topology Constants
// =============================================================================

/// Number of published topology snapshots retained for replay by late consumers.
pub const DEFAULT_TOPOLOGY_HISTORY_CAPACITY: usize = 256;

/// Capacity of the discovery event channel handed to the registry listener.
pub const DISCOVERY_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Remote Call Constants
// =============================================================================

/// Default timeout for a single read-through or write-through call (milliseconds).
pub const DEFAULT_REMOTE_CALL_TIMEOUT_MS: u64 = 5_000;

/// Default number of retries after a `NodeUnreachable` failure.
pub const DEFAULT_UNREACHABLE_MAX_RETRIES: usize = 3;

/// Default initial backoff between unreachable retries (milliseconds).
pub const DEFAULT_UNREACHABLE_MIN_BACKOFF_MS: u64 = 20;

/// Default maximum backoff between unreachable retries (milliseconds).
pub const DEFAULT_UNREACHABLE_MAX_BACKOFF_MS: u64 = 1_000;

/// Default maximum number of entries held by a near cache.
pub const DEFAULT_NEAR_CACHE_CAPACITY: usize = 100_000;
