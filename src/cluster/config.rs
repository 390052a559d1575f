//! Configuration for the grid core.
//!
//! # Configuration Profiles
//!
//! ```rust,no_run
//! use gridaffinity::cluster::{ClusterConfig, ClusterProfile};
//!
//! // Development profile - relaxed timeouts, small caches
//! let dev_config = ClusterConfig::from_profile(ClusterProfile::Development);
//!
//! // Production profile - balanced safety and latency
//! let prod_config = ClusterConfig::from_profile(ClusterProfile::Production);
//!
//! // Low-latency profile - tight timeouts, no automatic retries
//! let ll_config = ClusterConfig::from_profile(ClusterProfile::LowLatency);
//! ```
//!
//! # Single-key retry policy
//!
//! Whether a plain `get`/`put` is retried once under a new topology after a
//! topology loss is a deployment decision. [`TopologyRetryPolicy`] therefore has
//! no default: it is chosen either through a profile or explicitly.
//! Transactions never retry regardless of this setting.

use std::time::Duration;

use super::affinity::AffinityConfig;
use super::error::{ClusterError, ClusterResult};
use crate::constants::{
    DEFAULT_BACKUPS, DEFAULT_NEAR_CACHE_CAPACITY, DEFAULT_PARTITIONS,
    DEFAULT_REMOTE_CALL_TIMEOUT_MS, DEFAULT_TOPOLOGY_HISTORY_CAPACITY,
    DEFAULT_UNREACHABLE_MAX_BACKOFF_MS, DEFAULT_UNREACHABLE_MAX_RETRIES,
    DEFAULT_UNREACHABLE_MIN_BACKOFF_MS, MAX_BACKUPS, MAX_PARTITIONS,
    RECOGNIZED_ATTRIBUTE_KEYS,
};

/// What a single-key operation does after detecting topology loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Surface the topology loss to the caller.
    Abort,
    /// Re-run the operation once against the new topology.
    RetryOnce,
}

impl RetryMode {
    /// Number of additional attempts permitted after a topology loss.
    pub fn extra_attempts(&self) -> usize {
        match self {
            RetryMode::Abort => 0,
            RetryMode::RetryOnce => 1,
        }
    }
}

impl std::fmt::Display for RetryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryMode::Abort => write!(f, "abort"),
            RetryMode::RetryOnce => write!(f, "retry-once"),
        }
    }
}

impl std::str::FromStr for RetryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" | "never" => Ok(RetryMode::Abort),
            "retry-once" | "retry_once" | "once" => Ok(RetryMode::RetryOnce),
            _ => Err(format!(
                "Unknown retry mode '{}'. Valid modes: abort, retry-once",
                s
            )),
        }
    }
}

/// Retry behavior of single-key reads and writes on topology loss.
///
/// Deliberately has no `Default` implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyRetryPolicy {
    pub read: RetryMode,
    pub write: RetryMode,
}

impl TopologyRetryPolicy {
    pub const fn new(read: RetryMode, write: RetryMode) -> Self {
        Self { read, write }
    }

    /// Abort every operation on topology loss.
    pub const fn always_abort() -> Self {
        Self::new(RetryMode::Abort, RetryMode::Abort)
    }
}

/// Validated configuration profiles.
///
/// | Profile | Timeouts | Unreachable retries | Single-key retry |
/// |---------|----------|---------------------|------------------|
/// | Development | Relaxed | 5 | read once, write abort |
/// | Production | Balanced | 3 | read once, write abort |
/// | LowLatency | Tight | 1 | abort both |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterProfile {
    /// Local development and tests.
    Development,
    /// General production workloads.
    Production,
    /// Latency sensitive clients that prefer failing fast.
    LowLatency,
}

impl ClusterProfile {
    /// Get a human-readable description of the profile.
    pub fn description(&self) -> &'static str {
        match self {
            ClusterProfile::Development => "Local development and testing",
            ClusterProfile::Production => "Balanced production workloads",
            ClusterProfile::LowLatency => "Minimum latency, fail fast",
        }
    }

    /// Get all available profiles.
    pub fn all() -> &'static [ClusterProfile] {
        &[
            ClusterProfile::Development,
            ClusterProfile::Production,
            ClusterProfile::LowLatency,
        ]
    }
}

impl std::fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterProfile::Development => write!(f, "development"),
            ClusterProfile::Production => write!(f, "production"),
            ClusterProfile::LowLatency => write!(f, "low-latency"),
        }
    }
}

impl std::str::FromStr for ClusterProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(ClusterProfile::Development),
            "production" | "prod" => Ok(ClusterProfile::Production),
            "low-latency" | "latency" | "ll" => Ok(ClusterProfile::LowLatency),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production, low-latency",
                s
            )),
        }
    }
}

/// Configuration shared by every component of a grid member.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of partitions. Fixed for the lifetime of the cluster.
    pub partitions: u32,

    /// Backup copies per partition in addition to the primary.
    pub backups: usize,

    /// Attribute whose equal values must not hold two copies of one partition.
    pub exclusion_attribute: Option<String>,

    /// Published topology snapshots retained for replay.
    pub topology_history_capacity: usize,

    /// Timeout for a single read-through / write-through call.
    pub remote_call_timeout: Duration,

    /// Retries after `NodeUnreachable` before escalating.
    pub unreachable_max_retries: usize,

    /// Initial backoff between unreachable retries.
    pub unreachable_min_backoff: Duration,

    /// Maximum backoff between unreachable retries.
    pub unreachable_max_backoff: Duration,

    /// Single-key retry behavior on topology loss.
    pub retry_policy: TopologyRetryPolicy,

    /// Maximum entries held by a near cache.
    pub near_cache_capacity: usize,
}

impl ClusterConfig {
    /// Build a configuration with default sizing and an explicit retry policy.
    pub fn new(retry_policy: TopologyRetryPolicy) -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            backups: DEFAULT_BACKUPS,
            exclusion_attribute: None,
            topology_history_capacity: DEFAULT_TOPOLOGY_HISTORY_CAPACITY,
            remote_call_timeout: Duration::from_millis(DEFAULT_REMOTE_CALL_TIMEOUT_MS),
            unreachable_max_retries: DEFAULT_UNREACHABLE_MAX_RETRIES,
            unreachable_min_backoff: Duration::from_millis(DEFAULT_UNREACHABLE_MIN_BACKOFF_MS),
            unreachable_max_backoff: Duration::from_millis(DEFAULT_UNREACHABLE_MAX_BACKOFF_MS),
            retry_policy,
            near_cache_capacity: DEFAULT_NEAR_CACHE_CAPACITY,
        }
    }

    /// Create a configuration from a profile.
    pub fn from_profile(profile: ClusterProfile) -> Self {
        match profile {
            ClusterProfile::Development => Self {
                remote_call_timeout: Duration::from_secs(30),
                unreachable_max_retries: 5,
                near_cache_capacity: 10_000,
                ..Self::new(TopologyRetryPolicy::new(
                    RetryMode::RetryOnce,
                    RetryMode::Abort,
                ))
            },
            ClusterProfile::Production => Self::new(TopologyRetryPolicy::new(
                RetryMode::RetryOnce,
                RetryMode::Abort,
            )),
            ClusterProfile::LowLatency => Self {
                remote_call_timeout: Duration::from_millis(500),
                unreachable_max_retries: 1,
                unreachable_min_backoff: Duration::from_millis(5),
                unreachable_max_backoff: Duration::from_millis(50),
                ..Self::new(TopologyRetryPolicy::always_abort())
            },
        }
    }

    /// Set the partition count.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the backup count.
    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    /// Set the neighborhood exclusion attribute.
    pub fn with_exclusion_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.exclusion_attribute = Some(attribute.into());
        self
    }

    /// Set the single-key retry policy.
    pub fn with_retry_policy(mut self, policy: TopologyRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The subset of settings consumed by the affinity function.
    pub fn affinity(&self) -> AffinityConfig {
        AffinityConfig {
            partitions: self.partitions,
            backups: self.backups,
            exclusion_attribute: self.exclusion_attribute.clone(),
        }
    }

    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            errors.push(format!(
                "partitions ({}) must be between 1 and {}",
                self.partitions, MAX_PARTITIONS
            ));
        }

        if self.backups > MAX_BACKUPS {
            errors.push(format!(
                "backups ({}) must not exceed {}",
                self.backups, MAX_BACKUPS
            ));
        }

        if let Some(attr) = &self.exclusion_attribute
            && !RECOGNIZED_ATTRIBUTE_KEYS.contains(&attr.as_str())
        {
            errors.push(format!(
                "exclusion_attribute '{}' is not a recognized attribute key ({})",
                attr,
                RECOGNIZED_ATTRIBUTE_KEYS.join(", ")
            ));
        }

        if self.topology_history_capacity < 2 {
            errors.push(format!(
                "topology_history_capacity ({}) must be at least 2",
                self.topology_history_capacity
            ));
        }

        if self.remote_call_timeout.is_zero() {
            errors.push("remote_call_timeout must be non-zero".to_string());
        }

        if self.unreachable_min_backoff > self.unreachable_max_backoff {
            errors.push(format!(
                "unreachable_min_backoff ({:?}) must not exceed unreachable_max_backoff ({:?})",
                self.unreachable_min_backoff, self.unreachable_max_backoff
            ));
        }

        if self.near_cache_capacity == 0 {
            errors.push("near_cache_capacity must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GRID_PROFILE`: base profile ("development", "production", "low-latency")
    /// - `GRID_PARTITIONS`: partition count (default: 1024)
    /// - `GRID_BACKUPS`: backup count (default: 1)
    /// - `GRID_EXCLUSION_ATTRIBUTE`: attribute key for neighborhood exclusion
    /// - `GRID_REMOTE_CALL_TIMEOUT_MS`: per-call timeout
    /// - `GRID_UNREACHABLE_MAX_RETRIES`: retries after an unreachable primary
    /// - `GRID_READ_RETRY` / `GRID_WRITE_RETRY`: "abort" or "retry-once"
    ///
    /// Either `GRID_PROFILE` or both `GRID_READ_RETRY` and `GRID_WRITE_RETRY`
    /// must be set so that the single-key retry behavior is always a stated choice.
    pub fn from_env() -> ClusterResult<Self> {
        let profile = match std::env::var("GRID_PROFILE") {
            Ok(s) => Some(s.parse::<ClusterProfile>().map_err(ClusterError::Config)?),
            Err(_) => None,
        };

        let read_retry = parse_env::<RetryMode>("GRID_READ_RETRY")?;
        let write_retry = parse_env::<RetryMode>("GRID_WRITE_RETRY")?;

        let mut config = match (profile, read_retry, write_retry) {
            (Some(profile), _, _) => Self::from_profile(profile),
            (None, Some(read), Some(write)) => Self::new(TopologyRetryPolicy::new(read, write)),
            (None, _, _) => {
                return Err(ClusterError::Config(
                    "set GRID_PROFILE or both GRID_READ_RETRY and GRID_WRITE_RETRY".to_string(),
                ));
            }
        };

        if let Some(read) = read_retry {
            config.retry_policy.read = read;
        }
        if let Some(write) = write_retry {
            config.retry_policy.write = write;
        }
        if let Some(partitions) = parse_env::<u32>("GRID_PARTITIONS")? {
            config.partitions = partitions;
        }
        if let Some(backups) = parse_env::<usize>("GRID_BACKUPS")? {
            config.backups = backups;
        }
        if let Ok(attr) = std::env::var("GRID_EXCLUSION_ATTRIBUTE")
            && !attr.trim().is_empty()
        {
            config.exclusion_attribute = Some(attr.trim().to_string());
        }
        if let Some(ms) = parse_env::<u64>("GRID_REMOTE_CALL_TIMEOUT_MS")? {
            config.remote_call_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_env::<usize>("GRID_UNREACHABLE_MAX_RETRIES")? {
            config.unreachable_max_retries = retries;
        }

        if let Err(errors) = config.validate() {
            return Err(ClusterError::Config(format!(
                "Configuration validation failed: {}",
                errors.join("; ")
            )));
        }

        Ok(config)
    }
}

fn parse_env<T>(name: &str) -> ClusterResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ClusterError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}
