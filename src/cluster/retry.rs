//! Retry policy for coordination service writes.
//!
//! Request paths never retry: a failed forward or a lost election is
//! reported to the caller, who owns the retry decision. The only retried
//! operation is re-announcing this server after its coordination session
//! comes back, where a transient failure would otherwise leave the server
//! invisible to its peers until the next reconnect.
//!
//! # Example
//!
//! ```rust,no_run
//! use patchlog_cluster::cluster::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async {
//!         // your fallible operation
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .retry(retry::coordinator_policy())
//!     .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use super::error::{ClusterError, ClusterResult};

/// Policy for coordination service writes (membership re-registration).
///
/// Characteristics:
/// - Moderate initial delay (50ms) so a reconnecting session can settle
/// - Long max delay (5s) for coordination service elections
/// - Many retries (10) for transient failures
/// - Includes jitter so a whole cluster reconnecting does not retry in lockstep
pub fn coordinator_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Run a coordination operation under [`coordinator_policy`], retrying only
/// errors that [`ClusterError::is_retriable`] accepts.
pub async fn with_coordinator_policy<F, Fut, T>(policy_name: &str, operation: F) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ClusterResult<T>>,
{
    let mut attempt = 0u32;
    let result = operation
        .retry(coordinator_policy())
        .when(|e: &ClusterError| e.is_retriable())
        .notify(|e: &ClusterError, delay: Duration| {
            attempt += 1;
            record_retry_attempt(policy_name, attempt);
            tracing::debug!(policy = policy_name, error = %e, ?delay, "Retrying coordination call");
        })
        .await;

    match &result {
        Ok(_) => record_retry_success(policy_name),
        Err(_) => record_retry_exhausted(policy_name),
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed or the error was not retriable).
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a retry success.
pub fn record_retry_success(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}
