//! Prometheus metrics for the grid core.
//!
//! Metrics cover:
//! - Topology (published version, live servers and clients)
//! - Affinity (degraded partitions per assignment)
//! - Movement plans (issued, superseded, acknowledged, stale acknowledgements)
//! - Near cache operations (hits, read-throughs, invalidations)
//! - Topology guard (topology loss per operation kind, remote call latency, retries)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "gridaffinity" prefix
//! to avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are handled gracefully: if a metric fails to
//! register, an unregistered fallback is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for grid metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("gridaffinity".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Topology metrics
// =============================================================================

define_gauge!(
    TOPOLOGY_VERSION,
    "topology_version",
    "Latest published topology version"
);
define_gauge_vec!(
    LIVE_NODES,
    "live_nodes",
    "Live nodes in the latest topology by role",
    ["role"]
);
define_counter_vec!(
    DISCOVERY_EVENTS,
    "discovery_events_total",
    "Discovery events processed by the topology registry",
    ["event", "outcome"]
);

// =============================================================================
// Affinity metrics
// =============================================================================

define_gauge!(
    DEGRADED_PARTITIONS,
    "degraded_partitions",
    "Partitions whose latest assignment has fewer copies than requested"
);
define_counter!(
    ASSIGNMENTS_COMPUTED,
    "assignments_computed_total",
    "Assignments computed by the affinity engine"
);

// =============================================================================
// Movement plan metrics
// =============================================================================

define_counter_vec!(
    MOVEMENT_PLANS,
    "movement_plans_total",
    "Movement plan lifecycle events",
    ["event"]
);

// =============================================================================
// Near cache metrics
// =============================================================================

define_counter_vec!(
    NEAR_CACHE_OPERATIONS,
    "near_cache_operations_total",
    "Near cache operations",
    ["op", "result"]
);
define_gauge!(
    NEAR_CACHE_ENTRIES,
    "near_cache_entries",
    "Entries currently held by near caches in this process"
);

// =============================================================================
// Topology guard metrics
// =============================================================================

define_counter_vec!(
    TOPOLOGY_LOSS,
    "topology_loss_total",
    "Operations failed with topology loss",
    ["kind"]
);
define_histogram_vec!(
    REMOTE_CALL_DURATION,
    "remote_call_duration_seconds",
    "Duration of read-through and write-through calls to a primary",
    ["op", "outcome"],
    [0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts against unreachable primaries",
    ["operation", "outcome"]
);
define_counter_vec!(
    TRANSACTIONS,
    "transactions_total",
    "Finished transactions",
    ["concurrency", "outcome"]
);

// =============================================================================
// Safe registration
// =============================================================================

/// Register an IntGauge safely, returning a fallback on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntGaugeVec safely, returning a fallback on error.
fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning a fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning a fallback on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning a fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric.
///
/// Idempotent. Metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*TOPOLOGY_VERSION;
    let _ = &*LIVE_NODES;
    let _ = &*DISCOVERY_EVENTS;
    let _ = &*DEGRADED_PARTITIONS;
    let _ = &*ASSIGNMENTS_COMPUTED;
    let _ = &*MOVEMENT_PLANS;
    let _ = &*NEAR_CACHE_OPERATIONS;
    let _ = &*NEAR_CACHE_ENTRIES;
    let _ = &*TOPOLOGY_LOSS;
    let _ = &*REMOTE_CALL_DURATION;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*TRANSACTIONS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

/// Record a newly published topology.
pub fn record_topology_published(version: u64, servers: usize, clients: usize) {
    TOPOLOGY_VERSION.set(version as i64);
    LIVE_NODES.with_label_values(&["server"]).set(servers as i64);
    LIVE_NODES.with_label_values(&["client"]).set(clients as i64);
}

/// Record a discovery event and what the registry did with it.
pub fn record_discovery_event(event: &str, outcome: &str) {
    DISCOVERY_EVENTS.with_label_values(&[event, outcome]).inc();
}

/// Record a computed assignment and how many of its partitions are degraded.
pub fn record_assignment(degraded: usize) {
    ASSIGNMENTS_COMPUTED.inc();
    DEGRADED_PARTITIONS.set(degraded as i64);
}

/// Record a movement plan event: "issued", "superseded", "acknowledged" or "stale_ack".
pub fn record_movement_plan(event: &str) {
    MOVEMENT_PLANS.with_label_values(&[event]).inc();
}

/// Record a near cache operation.
pub fn record_near_cache(op: &str, result: &str) {
    NEAR_CACHE_OPERATIONS.with_label_values(&[op, result]).inc();
}

/// Adjust the near cache entry gauge.
pub fn add_near_cache_entries(delta: i64) {
    NEAR_CACHE_ENTRIES.add(delta);
}

/// Record an operation that failed with topology loss.
pub fn record_topology_loss(kind: &str) {
    TOPOLOGY_LOSS.with_label_values(&[kind]).inc();
}

/// Record the duration of a call to a primary.
pub fn record_remote_call(op: &str, outcome: &str, duration_secs: f64) {
    REMOTE_CALL_DURATION
        .with_label_values(&[op, outcome])
        .observe(duration_secs);
}

/// Record a finished transaction.
pub fn record_transaction(concurrency: &str, outcome: &str) {
    TRANSACTIONS
        .with_label_values(&[concurrency, outcome])
        .inc();
}
