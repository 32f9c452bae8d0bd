//! Cluster coordination for replicated patch logs.
//!
//! Every server keeps its own copy of each dataset's patch log. For each
//! dataset, one server at a time is the leader and is the only one that
//! appends; the others forward writes to it and pull what they are missing
//! in the background.
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────┐   forward    ┌──────────┐
//!        │ Server A │ ◄─────────── │ Server B │
//!        │ (leader) │ ───────────► │(follower)│
//!        └────┬─────┘  reconcile   └────┬─────┘
//!             │                         │
//!             └───────────┬─────────────┘
//!                         ▼
//!               ┌───────────────────┐
//!               │   Coordination    │ ← membership, dataset heads,
//!               │     service       │   ephemeral leadership records
//!               └───────────────────┘
//! ```
//!
//! - [`ClusterDirectory`]: membership, dataset records, leader election and
//!   leadership watches
//! - [`CoordinatedLogService`]: the request surface; routes writes to the
//!   leader and reads to the local copy first
//! - [`SyncReport`]: outcome of one reconciliation round
//!
//! The log store, the coordination service and the peer transport are
//! collaborators behind [`LogStore`], [`CoordinationClient`] and
//! [`PeerTransport`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use patchlog_cluster::cluster::{ClusterConfig, CoordinatedLogService, PeerHandler};
//! use patchlog_cluster::cluster::memory::{LocalPeerTransport, MemoryCoordination, MemoryLogStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordination = MemoryCoordination::new();
//!     let transport = Arc::new(LocalPeerTransport::new());
//!
//!     let config = ClusterConfig::from_env()?;
//!     let url = config.url.clone();
//!     let service = Arc::new(CoordinatedLogService::new(
//!         config,
//!         Arc::new(MemoryLogStore::new()),
//!         coordination.client().await,
//!         transport.clone(),
//!     )?);
//!     transport.register(&url, service.clone() as Arc<dyn PeerHandler>);
//!
//!     service.start().await?;
//!     service.create_patch_log("orders").await?;
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

pub mod background_tasks;
mod config;
mod directory;
mod error;
mod keys;
pub mod leadership_view;
pub mod metrics;
pub mod peer;
mod reconcile;
pub mod retry;
mod service;
pub mod session;
mod traits;

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

pub use background_tasks::{BackgroundTaskRegistry, TaskStatus};
pub use config::{ClusterConfig, ClusterProfile, DEFAULT_PORT};
pub use directory::{ClusterDirectory, LeadershipCallback};
pub use error::{ClusterError, ClusterResult};
pub use keys::{Keys, MAX_DATASET_NAME_LEN, validate_dataset_name};
pub use leadership_view::LocalLeadershipView;
pub use peer::{PeerClient, PeerHandler, PeerRequest, PeerResponse, PeerTransport, RemoteError};
pub use reconcile::SyncReport;
pub use service::{CoordinatedLogService, ServiceStatus};
pub use session::SessionState;
pub use traits::{CoordinationClient, LogStore, SessionEvent, WatchEvent, WatchEventKind};
