//! # patchlog-cluster
//! Cluster coordination for replicated patch logs.
//!
//! A patch log is an append-only sequence of patches identified by its head.
//! This crate lets several servers hold copies of the same logs while exactly
//! one server per dataset accepts writes:
//!
//! - leader election through ephemeral records in a coordination service
//!   (atomic create-if-absent, released when the holder's session ends)
//! - leadership watches that fail over automatically
//! - forwarding of writes (and of reads the local copy cannot answer) to the
//!   leader
//! - periodic reconciliation that pulls missing datasets and patches from
//!   peers
//!
//! The crate does not store patches, speak to a particular coordination
//! service, or move bytes between servers itself. Those are collaborators:
//! see [`LogStore`](cluster::LogStore),
//! [`CoordinationClient`](cluster::CoordinationClient) and
//! [`PeerTransport`](cluster::PeerTransport). In-process implementations
//! of all three live in `cluster::memory` behind the `test-utilities`
//! feature.
//!
//! ## Getting started
//! ```toml
//! patchlog-cluster = "0.1"
//! ```
//!
//! See [`cluster`] for a complete example.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports.
    //!
    //! ```rust
    //! use patchlog_cluster::prelude::*;
    //!
    //! let patch = Patch::new("p1", None, "payload");
    //! assert!(patch.follows(&LogId::initial()));
    //! ```
    pub use crate::cluster::{
        ClusterConfig, ClusterDirectory, ClusterError, ClusterResult, CoordinatedLogService,
        CoordinationClient, LogStore, PeerHandler, PeerTransport, ServiceStatus, SyncReport,
    };
    pub use crate::types::{
        DatasetRecord, LeadershipRecord, LogId, Patch, PatchLogInfo, ServerIdentity,
    };

    pub use bytes;
}
