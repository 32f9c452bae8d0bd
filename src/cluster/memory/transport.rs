//! In-process peer transport.
//!
//! Servers register their [`PeerHandler`] under their URL. Every call is
//! JSON-encoded and decoded on both legs so the wire types are exercised
//! exactly as a network transport would.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::peer::{PeerHandler, PeerRequest, PeerResponse, PeerTransport};
use crate::types::ServerIdentity;

/// Routes peer requests to handlers living in the same process.
#[derive(Default)]
pub struct LocalPeerTransport {
    handlers: DashMap<String, Weak<dyn PeerHandler>>,
    unreachable: DashSet<String>,
    failing: DashSet<(String, &'static str)>,
    delays: DashMap<String, Duration>,
    calls: DashMap<(String, &'static str), usize>,
}

impl LocalPeerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handler` reachable at `url`. The transport holds it weakly.
    pub fn register(&self, url: &str, handler: Arc<dyn PeerHandler>) {
        self.handlers
            .insert(url.to_string(), Arc::downgrade(&handler));
    }

    pub fn deregister(&self, url: &str) {
        self.handlers.remove(url);
    }

    /// Fail every call to `url` until [`heal`](Self::heal).
    pub fn partition(&self, url: &str) {
        self.unreachable.insert(url.to_string());
    }

    pub fn heal(&self, url: &str) {
        self.unreachable.remove(url);
    }

    /// Fail calls of one `operation` to `url`, leaving the others working.
    pub fn fail_operation(&self, url: &str, operation: &'static str) {
        self.failing.insert((url.to_string(), operation));
    }

    pub fn clear_failures(&self, url: &str) {
        self.failing.retain(|(failing_url, _)| failing_url != url);
    }

    /// Delay every call to `url`.
    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.delays.insert(url.to_string(), delay);
    }

    /// Number of calls of `operation` made to `url`.
    pub fn call_count(&self, url: &str, operation: &str) -> usize {
        self.calls
            .iter()
            .filter(|entry| entry.key().0 == url && entry.key().1 == operation)
            .map(|entry| *entry.value())
            .sum()
    }

    fn unavailable(target: &ServerIdentity, message: impl Into<String>) -> ClusterError {
        ClusterError::PeerUnavailable {
            peer: target.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl PeerTransport for LocalPeerTransport {
    async fn call(
        &self,
        target: &ServerIdentity,
        request: PeerRequest,
    ) -> ClusterResult<PeerResponse> {
        *self
            .calls
            .entry((target.url.clone(), request.operation()))
            .or_insert(0) += 1;

        let delay = self.delays.get(&target.url).map(|delay| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unreachable.contains(&target.url) {
            return Err(Self::unavailable(target, "connection refused"));
        }
        if self
            .failing
            .contains(&(target.url.clone(), request.operation()))
        {
            return Err(Self::unavailable(target, "connection reset"));
        }

        let handler = self
            .handlers
            .get(&target.url)
            .and_then(|handler| handler.upgrade())
            .ok_or_else(|| Self::unavailable(target, "no server listening"))?;

        let encoded = serde_json::to_vec(&request)?;
        let request: PeerRequest = serde_json::from_slice(&encoded)?;

        let response = handler.handle_peer_request(request).await;

        let encoded = serde_json::to_vec(&response)?;
        Ok(serde_json::from_slice(&encoded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogId;

    struct Echo;

    #[async_trait]
    impl PeerHandler for Echo {
        async fn handle_peer_request(&self, request: PeerRequest) -> PeerResponse {
            match request {
                PeerRequest::DatasetVersion { dataset } => PeerResponse::Version {
                    head: LogId::new(dataset),
                },
                _ => PeerResponse::Datasets { datasets: vec![] },
            }
        }
    }

    fn target() -> ServerIdentity {
        ServerIdentity::new("b", "http://b:1066")
    }

    #[tokio::test]
    async fn test_routes_to_registered_handler() {
        let transport = LocalPeerTransport::new();
        let handler: Arc<dyn PeerHandler> = Arc::new(Echo);
        transport.register("http://b:1066", handler.clone());

        let response = transport
            .call(
                &target(),
                PeerRequest::DatasetVersion {
                    dataset: "orders".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            PeerResponse::Version {
                head: LogId::new("orders")
            }
        );
        assert_eq!(transport.call_count("http://b:1066", "dataset_version"), 1);
    }

    #[tokio::test]
    async fn test_partition_and_dropped_handler() {
        let transport = LocalPeerTransport::new();
        let handler: Arc<dyn PeerHandler> = Arc::new(Echo);
        transport.register("http://b:1066", handler.clone());

        transport.partition("http://b:1066");
        let err = transport
            .call(&target(), PeerRequest::ListDatasets)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnavailable { .. }));

        transport.heal("http://b:1066");
        assert!(transport.call(&target(), PeerRequest::ListDatasets).await.is_ok());

        drop(handler);
        assert!(transport.call(&target(), PeerRequest::ListDatasets).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_operation_leaves_others_working() {
        let transport = LocalPeerTransport::new();
        let handler: Arc<dyn PeerHandler> = Arc::new(Echo);
        transport.register("http://b:1066", handler.clone());

        transport.fail_operation("http://b:1066", "list_datasets");
        let err = transport
            .call(&target(), PeerRequest::ListDatasets)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnavailable { .. }));

        let version = PeerRequest::DatasetVersion {
            dataset: "orders".into(),
        };
        assert!(transport.call(&target(), version).await.is_ok());

        transport.clear_failures("http://b:1066");
        assert!(transport.call(&target(), PeerRequest::ListDatasets).await.is_ok());
    }
}
