//! Retry policies for calls to unreachable primaries.
//!
//! Built on the `backon` crate. Only `NodeUnreachable` is ever retried here;
//! topology loss is never retried at this level.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `unreachable_policy` | config | config | config | Read/write-through to a live primary |
//! | `with_unreachable_policy` | config | config | config | Undoing a write on a live node |
//!
//! # Example
//!
//! ```rust,no_run
//! use gridaffinity::cluster::{ClusterConfig, ClusterError, ClusterProfile, retry};
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), ClusterError> {
//!     let config = ClusterConfig::from_profile(ClusterProfile::Production);
//!     (|| async { Ok::<_, ClusterError>(()) })
//!         .retry(retry::unreachable_policy(&config))
//!         .when(|e| e.is_retriable())
//!         .await
//! }
//! ```

use backon::{ExponentialBuilder, Retryable};

use super::config::ClusterConfig;

/// Policy for retrying a primary that is unreachable but still live.
///
/// Bounded by `unreachable_max_retries`, with exponential backoff between
/// `unreachable_min_backoff` and `unreachable_max_backoff`, plus jitter.
pub fn unreachable_policy(config: &ClusterConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.unreachable_min_backoff)
        .with_max_delay(config.unreachable_max_backoff)
        .with_max_times(config.unreachable_max_retries)
        .with_jitter()
}

/// Execute an async operation with the unreachable-primary policy.
pub async fn with_unreachable_policy<F, Fut, T, E, C>(
    config: &ClusterConfig,
    operation: F,
    condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(unreachable_policy(config))
        .when(condition)
        .await
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(operation: &str, attempt: u32) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[operation, "attempt"])
        .inc();

    tracing::debug!(operation, attempt, "Retrying unreachable primary");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(operation: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[operation, "exhausted"])
        .inc();

    tracing::warn!(operation, "Retries against unreachable primary exhausted");
}

/// Record a success after at least one retry.
pub fn record_retry_success(operation: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[operation, "success"])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::{ClusterProfile, TopologyRetryPolicy};
    use crate::cluster::error::ClusterError;
    use crate::types::NodeId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_config(retries: usize) -> ClusterConfig {
        ClusterConfig {
            unreachable_max_retries: retries,
            unreachable_min_backoff: Duration::from_millis(1),
            unreachable_max_backoff: Duration::from_millis(2),
            ..ClusterConfig::new(TopologyRetryPolicy::always_abort())
        }
    }

    fn unreachable() -> ClusterError {
        ClusterError::NodeUnreachable {
            node: NodeId::from_u128(1),
            reason: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_policy_builds_from_profile() {
        let _ = unreachable_policy(&ClusterConfig::from_profile(ClusterProfile::Production));
    }

    #[tokio::test]
    async fn test_unreachable_retried_until_success() {
        let attempts = AtomicU32::new(0);

        let result = with_unreachable_policy(
            &quick_config(3),
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unreachable())
                } else {
                    Ok(7)
                }
            },
            |e: &ClusterError| e.is_retriable(),
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_exhausts_after_max_retries() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), ClusterError> = with_unreachable_policy(
            &quick_config(2),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(unreachable())
            },
            |e: &ClusterError| e.is_retriable(),
        )
        .await;

        assert!(result.unwrap_err().is_retriable());
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_topology_loss_is_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), ClusterError> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::NodeDeparted {
                node: NodeId::from_u128(1),
            })
        })
        .retry(unreachable_policy(&quick_config(3)))
        .when(|e| e.is_retriable())
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_record_retry_helpers() {
        record_retry_attempt("get", 1);
        record_retry_success("get");
        record_retry_exhausted("put");
    }
}
