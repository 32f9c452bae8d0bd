//! Collaborator traits consumed by the cluster layer.
//!
//! These traits abstract the two external systems the cluster is built on,
//! allowing for:
//! - Different backends (a ZooKeeper-style service, a file-backed patch store)
//! - In-memory implementations for testing (see [`super::memory`])
//!
//! # Trait Overview
//!
//! - [`LogStore`]: the durable, append-only patch log store of one process
//! - [`CoordinationClient`]: hierarchical namespace with ephemeral nodes,
//!   atomic create-if-absent and one-shot watches
//!
//! The third collaborator, the peer transport, lives in [`super::peer`]
//! because the cluster layer defines its request set.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};

use crate::types::{LogId, Patch, PatchLogInfo};

use super::error::ClusterResult;

/// Local, durable patch log store.
///
/// Implementations must serialize appends to the same dataset internally:
/// a request append and a reconciliation append may race on one process and
/// the cluster layer adds no lock of its own.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Snapshot of every dataset held locally.
    async fn list(&self) -> ClusterResult<Vec<PatchLogInfo>>;

    /// Create an empty log at [`LogId::initial`].
    ///
    /// Fails with `DatasetExists` if the name is already held locally.
    async fn create(&self, name: &str) -> ClusterResult<LogId>;

    /// Name and head of one dataset. Fails with `UnknownDataset`.
    async fn info(&self, name: &str) -> ClusterResult<PatchLogInfo>;

    /// Append a patch and return the new head.
    ///
    /// With `expected_head` set, fails with `VersionConflict` unless it equals
    /// the current head. `None` skips the check. A patch already in the log
    /// fails with `DuplicatePatch`.
    async fn append(
        &self,
        name: &str,
        patch: Patch,
        expected_head: Option<&LogId>,
    ) -> ClusterResult<LogId>;

    /// Patches appended after `since`, in log order.
    ///
    /// Fails with `PatchesUnavailable` if `since` is not part of the local log.
    async fn get_patches(&self, name: &str, since: &LogId) -> ClusterResult<Vec<Patch>>;

    /// One patch by id, `None` if absent.
    async fn get_patch(&self, name: &str, id: &LogId) -> ClusterResult<Option<Patch>>;
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Deleted,
    DataChanged,
}

/// Notification delivered by a one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// Change in the state of this process's coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A (new) session is established.
    Connected,
    /// The connection dropped; the session may still be alive server side.
    Disconnected,
    /// The session ended; every ephemeral node it owned is gone.
    Expired,
}

/// Client of the cluster-wide coordination service.
///
/// Only the service's primitives are used; its consensus algorithm is not
/// this crate's concern. Every operation fails with `CoordinationUnavailable`
/// while the client is disconnected.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create an ephemeral node owned by this session, replacing a node this
    /// session already owns at `path`.
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> ClusterResult<()>;

    /// Atomically create `path` unless it exists. Returns whether it was created.
    async fn create_if_absent(&self, path: &str, data: Bytes, ephemeral: bool)
    -> ClusterResult<bool>;

    async fn get_data(&self, path: &str) -> ClusterResult<Option<Bytes>>;

    /// Overwrite the data of an existing node. Returns `false` if the node is absent.
    async fn set_data(&self, path: &str, data: Bytes) -> ClusterResult<bool>;

    /// Delete a node. Deleting an absent node is not an error.
    async fn delete(&self, path: &str) -> ClusterResult<()>;

    /// Atomically delete `path` only if its data equals `expected`.
    ///
    /// Returns whether the node was deleted. This is the conditional delete
    /// used to give up a leadership record without removing a successor's.
    async fn delete_if_equals(&self, path: &str, expected: &[u8]) -> ClusterResult<bool>;

    /// Names of the direct children of `path`.
    async fn list_children(&self, path: &str) -> ClusterResult<Vec<String>>;

    /// Register a one-shot watch on `path`.
    ///
    /// The receiver resolves at most once, on the next create, delete or data
    /// change of exactly `path`. It is dropped without a value when the
    /// session ends; callers re-register after every notification.
    async fn watch(&self, path: &str) -> ClusterResult<oneshot::Receiver<WatchEvent>>;

    /// Subscribe to session state changes.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
