//! In-process collaborators for tests and local clusters.
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! patchlog-cluster = { path = ".", features = ["test-utilities"] }
//! ```

mod coordination;
mod log_store;
mod transport;

pub use coordination::{MemoryCoordination, MemoryCoordinationClient};
pub use log_store::MemoryLogStore;
pub use transport::LocalPeerTransport;
