//! Multi-server harness shared by the integration tests.
//!
//! Every server gets its own in-memory log store and coordination session;
//! all of them share one coordination namespace and one in-process peer
//! transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use patchlog_cluster::cluster::memory::{
    LocalPeerTransport, MemoryCoordination, MemoryCoordinationClient, MemoryLogStore,
};
use patchlog_cluster::cluster::{ClusterConfig, CoordinatedLogService, LeadershipCallback};

pub type Service = CoordinatedLogService<MemoryLogStore, MemoryCoordinationClient>;

pub struct Node {
    pub service: Arc<Service>,
    pub store: Arc<MemoryLogStore>,
    pub client: Arc<MemoryCoordinationClient>,
}

impl Node {
    pub fn url(&self) -> &str {
        &self.service.identity().url
    }

    pub fn is_leader(&self, dataset: &str) -> bool {
        self.service.directory().view().is_leader(dataset)
    }
}

pub struct TestCluster {
    pub coordination: MemoryCoordination,
    pub transport: Arc<LocalPeerTransport>,
}

pub fn test_config(id: &str) -> ClusterConfig {
    let mut config = ClusterConfig::new(id, format!("http://{}:1066", id));
    config.coordination_timeout = Duration::from_millis(500);
    config.peer_timeout = Duration::from_millis(500);
    config.sync_interval = Duration::from_millis(50);
    config.sync_enabled = false;
    config.shutdown_timeout = Duration::from_millis(200);
    config
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            coordination: MemoryCoordination::new(),
            transport: Arc::new(LocalPeerTransport::new()),
        }
    }

    /// Build a server without starting it.
    pub async fn node_with(&self, config: ClusterConfig) -> Node {
        let store = Arc::new(MemoryLogStore::new());
        let client = self.coordination.client().await;
        let service = Arc::new(
            CoordinatedLogService::new(config, store.clone(), client.clone(), self.transport.clone())
                .expect("valid test config"),
        );
        self.transport
            .register(&service.identity().url, service.clone());
        Node {
            service,
            store,
            client,
        }
    }

    /// Build and start a server with reconciliation disabled.
    pub async fn node(&self, id: &str) -> Node {
        let node = self.node_with(test_config(id)).await;
        node.service.start().await.expect("start");
        node
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A callback that counts its invocations and remembers the last status.
pub fn counting_callback() -> (LeadershipCallback, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let leader_calls = Arc::new(AtomicUsize::new(0));
    let (c, l) = (calls.clone(), leader_calls.clone());
    let callback: LeadershipCallback = Arc::new(move |_, is_leader| {
        c.fetch_add(1, Ordering::SeqCst);
        if is_leader {
            l.fetch_add(1, Ordering::SeqCst);
        }
    });
    (callback, calls, leader_calls)
}
