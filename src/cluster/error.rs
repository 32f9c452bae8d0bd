//! Error types for the patch log cluster.
//!
//! # Error Handling Patterns
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Errors that decide the outcome of a single request go back to that
//! caller:
//! - `NoLeader`, `Forwarding`: retryable, the caller decides when to retry
//! - `VersionConflict`: the caller must re-read the head first
//! - `UnknownDataset`: the name is not known here or at the leader
//! - `InvalidDatasetName`: the name can never be used
//!
//! ## Best-Effort (Log and Continue)
//!
//! Errors inside background work never reach a request:
//! - One peer failing during reconciliation (`SyncPeer`)
//! - Publishing a new head to the coordination service after a local append
//! - Caching a patch fetched from the leader
//!
//! ## Coordination loss
//!
//! `CoordinationUnavailable` is fatal for leadership (every local leadership
//! flag is cleared) but not for the process, which keeps reconnecting.

use thiserror::Error;

use crate::types::LogId;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur in the patch log cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No server currently holds leadership for the dataset.
    #[error("No leader for dataset {dataset}")]
    NoLeader { dataset: String },

    /// The leader was unreachable or failed while handling a forwarded request.
    #[error("Forwarding {operation} for {dataset} to {leader} failed: {message}")]
    Forwarding {
        dataset: String,
        leader: String,
        operation: &'static str,
        message: String,
    },

    /// The expected head did not match the current head of the log.
    #[error("Version conflict on {dataset}: expected head {expected}, current head {actual}")]
    VersionConflict {
        dataset: String,
        expected: LogId,
        actual: LogId,
    },

    /// The dataset is not known.
    #[error("Unknown dataset {0}")]
    UnknownDataset(String),

    /// The dataset name cannot be used as a namespace segment.
    #[error("Invalid dataset name '{name}': {reason}")]
    InvalidDatasetName { name: String, reason: String },

    /// The dataset already exists locally.
    #[error("Dataset {0} already exists")]
    DatasetExists(String),

    /// Some patches after the requested head are not held locally.
    #[error("Patches after {since} are not available for {dataset}")]
    PatchesUnavailable { dataset: String, since: LogId },

    /// The patch is already part of the log.
    #[error("Patch {id} already present in {dataset}")]
    DuplicatePatch { dataset: String, id: LogId },

    /// A forwarded write reached a server that does not lead the dataset.
    #[error("Server {server_id} is not the leader for {dataset}")]
    NotLeader { dataset: String, server_id: String },

    /// A peer server could not be reached or answered nonsense.
    #[error("Peer {peer} unavailable: {message}")]
    PeerUnavailable { peer: String, message: String },

    /// The coordination service could not be reached.
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    /// A bounded call did not complete in time.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },

    /// Reconciliation with one peer failed. Never returned to request callers.
    #[error("Sync with peer {peer} failed: {message}")]
    SyncPeer { peer: String, message: String },

    /// Serialization/deserialization error.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The service is stopping or stopped.
    #[error("Service is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Check if this error is retriable as-is.
    ///
    /// Leadership and transport problems are expected to clear up on their
    /// own. A version conflict is not: the caller has to re-read the head.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::NoLeader { .. } => true,
            ClusterError::Forwarding { .. } => true,
            ClusterError::NotLeader { .. } => true,
            ClusterError::PeerUnavailable { .. } => true,
            ClusterError::CoordinationUnavailable(_) => true,
            ClusterError::Timeout { .. } => true,
            ClusterError::SyncPeer { .. } => true,

            ClusterError::VersionConflict { .. } => false,
            ClusterError::UnknownDataset(_) => false,
            ClusterError::DatasetExists(_) => false,
            ClusterError::InvalidDatasetName { .. } => false,
            ClusterError::PatchesUnavailable { .. } => false,
            ClusterError::DuplicatePatch { .. } => false,
            ClusterError::Codec(_) => false,
            ClusterError::Config(_) => false,
            ClusterError::ShuttingDown => false,
        }
    }

    /// Whether the local store could not answer because it lacks the data.
    ///
    /// These are the errors after which reads fall back to the leader.
    #[inline]
    pub fn is_missing_locally(&self) -> bool {
        matches!(
            self,
            ClusterError::UnknownDataset(_) | ClusterError::PatchesUnavailable { .. }
        )
    }

    /// Whether the coordination service itself is the problem.
    #[inline]
    pub fn is_coordination_failure(&self) -> bool {
        matches!(
            self,
            ClusterError::CoordinationUnavailable(_) | ClusterError::Timeout { .. }
        )
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ClusterError::NoLeader { .. } => "no_leader",
            ClusterError::Forwarding { .. } => "forwarding",
            ClusterError::VersionConflict { .. } => "version_conflict",
            ClusterError::UnknownDataset(_) => "unknown_dataset",
            ClusterError::DatasetExists(_) => "dataset_exists",
            ClusterError::InvalidDatasetName { .. } => "invalid_dataset_name",
            ClusterError::PatchesUnavailable { .. } => "patches_unavailable",
            ClusterError::DuplicatePatch { .. } => "duplicate_patch",
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::PeerUnavailable { .. } => "peer_unavailable",
            ClusterError::CoordinationUnavailable(_) => "coordination_unavailable",
            ClusterError::Timeout { .. } => "timeout",
            ClusterError::SyncPeer { .. } => "sync_peer",
            ClusterError::Codec(_) => "codec",
            ClusterError::Config(_) => "config",
            ClusterError::ShuttingDown => "shutting_down",
        }
    }
}
