//! Server-to-server requests.
//!
//! Forwarding and reconciliation talk to other servers through a closed set
//! of tagged request variants. The transport that moves them is a
//! collaborator ([`PeerTransport`]); the receiving side implements
//! [`PeerHandler`].
//!
//! Errors raised by the remote service travel back as [`RemoteError`] and are
//! turned into the matching [`ClusterError`] on arrival, so a version
//! conflict at the leader reaches the original caller as a version conflict.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{LogId, Patch, ServerIdentity};

use super::error::{ClusterError, ClusterResult};

/// Request sent to another server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    ListDatasets,
    DatasetVersion {
        dataset: String,
    },
    GetPatches {
        dataset: String,
        since: LogId,
    },
    GetPatch {
        dataset: String,
        id: LogId,
    },
    /// Forwarded append. `expected_head` is passed through verbatim.
    Append {
        dataset: String,
        patch: Patch,
        expected_head: Option<LogId>,
    },
}

impl PeerRequest {
    /// Operation name for logs, metrics and timeout errors.
    pub fn operation(&self) -> &'static str {
        match self {
            PeerRequest::ListDatasets => "list_datasets",
            PeerRequest::DatasetVersion { .. } => "dataset_version",
            PeerRequest::GetPatches { .. } => "get_patches",
            PeerRequest::GetPatch { .. } => "get_patch",
            PeerRequest::Append { .. } => "append",
        }
    }

    /// Dataset the request is about, for logs.
    pub fn dataset(&self) -> Option<&str> {
        match self {
            PeerRequest::ListDatasets => None,
            PeerRequest::DatasetVersion { dataset }
            | PeerRequest::GetPatches { dataset, .. }
            | PeerRequest::GetPatch { dataset, .. }
            | PeerRequest::Append { dataset, .. } => Some(dataset),
        }
    }
}

/// Response to a [`PeerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    Datasets { datasets: Vec<String> },
    Version { head: LogId },
    Patches { patches: Vec<Patch> },
    Patch { patch: Option<Patch> },
    Appended { head: LogId },
    Error { error: RemoteError },
}

/// Error reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    NoLeader { dataset: String },
    VersionConflict {
        dataset: String,
        expected: LogId,
        actual: LogId,
    },
    UnknownDataset { dataset: String },
    PatchesUnavailable { dataset: String, since: LogId },
    DuplicatePatch { dataset: String, id: LogId },
    NotLeader { dataset: String, server_id: String },
    ShuttingDown,
    Internal { message: String },
}

impl From<&ClusterError> for RemoteError {
    fn from(err: &ClusterError) -> Self {
        match err {
            ClusterError::NoLeader { dataset } => RemoteError::NoLeader {
                dataset: dataset.clone(),
            },
            ClusterError::VersionConflict {
                dataset,
                expected,
                actual,
            } => RemoteError::VersionConflict {
                dataset: dataset.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            ClusterError::UnknownDataset(dataset) => RemoteError::UnknownDataset {
                dataset: dataset.clone(),
            },
            ClusterError::PatchesUnavailable { dataset, since } => {
                RemoteError::PatchesUnavailable {
                    dataset: dataset.clone(),
                    since: since.clone(),
                }
            }
            ClusterError::DuplicatePatch { dataset, id } => RemoteError::DuplicatePatch {
                dataset: dataset.clone(),
                id: id.clone(),
            },
            ClusterError::NotLeader { dataset, server_id } => RemoteError::NotLeader {
                dataset: dataset.clone(),
                server_id: server_id.clone(),
            },
            ClusterError::ShuttingDown => RemoteError::ShuttingDown,
            other => RemoteError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl RemoteError {
    fn into_cluster_error(self, peer: &ServerIdentity) -> ClusterError {
        match self {
            RemoteError::NoLeader { dataset } => ClusterError::NoLeader { dataset },
            RemoteError::VersionConflict {
                dataset,
                expected,
                actual,
            } => ClusterError::VersionConflict {
                dataset,
                expected,
                actual,
            },
            RemoteError::UnknownDataset { dataset } => ClusterError::UnknownDataset(dataset),
            RemoteError::PatchesUnavailable { dataset, since } => {
                ClusterError::PatchesUnavailable { dataset, since }
            }
            RemoteError::DuplicatePatch { dataset, id } => {
                ClusterError::DuplicatePatch { dataset, id }
            }
            RemoteError::NotLeader { dataset, server_id } => {
                ClusterError::NotLeader { dataset, server_id }
            }
            RemoteError::ShuttingDown => ClusterError::PeerUnavailable {
                peer: peer.id.clone(),
                message: "peer is shutting down".to_string(),
            },
            RemoteError::Internal { message } => ClusterError::PeerUnavailable {
                peer: peer.id.clone(),
                message,
            },
        }
    }
}

impl PeerResponse {
    /// Wrap a service result into a response.
    pub fn from_result<T>(
        result: ClusterResult<T>,
        ok: impl FnOnce(T) -> PeerResponse,
    ) -> PeerResponse {
        match result {
            Ok(value) => ok(value),
            Err(e) => PeerResponse::Error {
                error: RemoteError::from(&e),
            },
        }
    }
}

/// Moves a request to another server and brings back its response.
///
/// Implementations report their own failures (unreachable, refused,
/// malformed reply) as `PeerUnavailable`. Timeouts are applied by
/// [`PeerClient`], not by the transport.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn call(&self, target: &ServerIdentity, request: PeerRequest)
    -> ClusterResult<PeerResponse>;
}

/// Server side of the peer protocol.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    /// Serve a request from another server. Never forwards it again.
    async fn handle_peer_request(&self, request: PeerRequest) -> PeerResponse;
}

/// Typed client for one peer with a per-call timeout.
#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn PeerTransport>,
    target: ServerIdentity,
    timeout: Duration,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PeerClient {
    pub fn new(transport: Arc<dyn PeerTransport>, target: ServerIdentity, timeout: Duration) -> Self {
        Self {
            transport,
            target,
            timeout,
        }
    }

    pub fn target(&self) -> &ServerIdentity {
        &self.target
    }

    async fn call(&self, request: PeerRequest) -> ClusterResult<PeerResponse> {
        let operation = request.operation();
        let response = tokio::time::timeout(self.timeout, self.transport.call(&self.target, request))
            .await
            .map_err(|_| ClusterError::Timeout {
                operation,
                millis: self.timeout.as_millis() as u64,
            })??;

        match response {
            PeerResponse::Error { error } => Err(error.into_cluster_error(&self.target)),
            other => Ok(other),
        }
    }

    fn unexpected(&self, operation: &str, response: PeerResponse) -> ClusterError {
        ClusterError::PeerUnavailable {
            peer: self.target.id.clone(),
            message: format!("unexpected response to {}: {:?}", operation, response),
        }
    }

    pub async fn list_datasets(&self) -> ClusterResult<Vec<String>> {
        match self.call(PeerRequest::ListDatasets).await? {
            PeerResponse::Datasets { datasets } => Ok(datasets),
            other => Err(self.unexpected("list_datasets", other)),
        }
    }

    pub async fn dataset_version(&self, dataset: &str) -> ClusterResult<LogId> {
        let request = PeerRequest::DatasetVersion {
            dataset: dataset.to_string(),
        };
        match self.call(request).await? {
            PeerResponse::Version { head } => Ok(head),
            other => Err(self.unexpected("dataset_version", other)),
        }
    }

    pub async fn get_patches(&self, dataset: &str, since: &LogId) -> ClusterResult<Vec<Patch>> {
        let request = PeerRequest::GetPatches {
            dataset: dataset.to_string(),
            since: since.clone(),
        };
        match self.call(request).await? {
            PeerResponse::Patches { patches } => Ok(patches),
            other => Err(self.unexpected("get_patches", other)),
        }
    }

    pub async fn get_patch(&self, dataset: &str, id: &LogId) -> ClusterResult<Option<Patch>> {
        let request = PeerRequest::GetPatch {
            dataset: dataset.to_string(),
            id: id.clone(),
        };
        match self.call(request).await? {
            PeerResponse::Patch { patch } => Ok(patch),
            other => Err(self.unexpected("get_patch", other)),
        }
    }

    pub async fn append(
        &self,
        dataset: &str,
        patch: Patch,
        expected_head: Option<LogId>,
    ) -> ClusterResult<LogId> {
        let request = PeerRequest::Append {
            dataset: dataset.to_string(),
            patch,
            expected_head,
        };
        match self.call(request).await? {
            PeerResponse::Appended { head } => Ok(head),
            other => Err(self.unexpected("append", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTransport {
        response: PeerResponse,
        delay: Duration,
    }

    #[async_trait]
    impl PeerTransport for FixedTransport {
        async fn call(
            &self,
            _target: &ServerIdentity,
            _request: PeerRequest,
        ) -> ClusterResult<PeerResponse> {
            tokio::time::sleep(self.delay).await;
            Ok(self.response.clone())
        }
    }

    fn client(response: PeerResponse, delay: Duration) -> PeerClient {
        PeerClient::new(
            Arc::new(FixedTransport { response, delay }),
            ServerIdentity::new("b", "http://b:1066"),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_request_wire_format() {
        let request = PeerRequest::Append {
            dataset: "orders".into(),
            patch: Patch::new("p1", None, "x"),
            expected_head: Some(LogId::initial()),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "append");
        assert_eq!(json["dataset"], "orders");
        assert_eq!(json["expected_head"], LogId::INITIAL);
        assert_eq!(request.operation(), "append");
        assert_eq!(request.dataset(), Some("orders"));
        assert_eq!(PeerRequest::ListDatasets.dataset(), None);
    }

    #[tokio::test]
    async fn test_remote_version_conflict_is_preserved() {
        let response = PeerResponse::from_result::<LogId>(
            Err(ClusterError::VersionConflict {
                dataset: "orders".into(),
                expected: LogId::new("h0"),
                actual: LogId::new("h1"),
            }),
            |head| PeerResponse::Appended { head },
        );

        let err = client(response, Duration::ZERO)
            .append("orders", Patch::new("p2", None, "y"), Some(LogId::new("h0")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_internal_remote_error_becomes_peer_unavailable() {
        let response = PeerResponse::from_result::<LogId>(
            Err(ClusterError::CoordinationUnavailable("down".into())),
            |head| PeerResponse::Appended { head },
        );
        let err = client(response, Duration::ZERO)
            .dataset_version("orders")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unexpected_response_variant() {
        let err = client(PeerResponse::Datasets { datasets: vec![] }, Duration::ZERO)
            .dataset_version("orders")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let err = client(
            PeerResponse::Datasets { datasets: vec![] },
            Duration::from_secs(5),
        )
        .list_datasets()
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Timeout {
                operation: "list_datasets",
                millis: 50
            }
        ));
        assert!(err.is_retriable());
    }
}
