//! In-memory coordination service.
//!
//! One [`MemoryCoordination`] is the shared namespace; every simulated server
//! gets its own [`MemoryCoordinationClient`] with its own session. Session
//! failures are driven by the test:
//!
//! - [`MemoryCoordinationClient::disconnect`] / [`reconnect`](MemoryCoordinationClient::reconnect):
//!   connection drops, the session (and its ephemeral nodes) survive
//! - [`MemoryCoordinationClient::expire_session`]: the session ends, its
//!   ephemeral nodes and watches are removed
//! - [`MemoryCoordinationClient::close`]: process crash, like expiry but the
//!   client never comes back
//! - [`MemoryCoordinationClient::stall`] / [`resume`](MemoryCoordinationClient::resume):
//!   calls hang without any session event, like an unresponsive service
//!
//! Parent nodes are implicit: children are found by path prefix.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, broadcast, oneshot};

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::traits::{CoordinationClient, SessionEvent, WatchEvent, WatchEventKind};

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    /// Owning session for ephemeral nodes.
    ephemeral_owner: Option<u64>,
}

struct WatchEntry {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Namespace {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<WatchEntry>>,
    next_session: u64,
}

impl Namespace {
    fn new_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn fire(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(entries) = self.watches.remove(path) {
            for entry in entries {
                let _ = entry.tx.send(WatchEvent {
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }

    /// Remove every trace of a session: its ephemeral nodes and its watches.
    fn end_session(&mut self, session: u64) -> usize {
        for entries in self.watches.values_mut() {
            entries.retain(|entry| entry.session != session);
        }
        self.watches.retain(|_, entries| !entries.is_empty());

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.nodes.remove(path);
            self.fire(path, WatchEventKind::Deleted);
        }
        owned.len()
    }
}

/// Shared in-memory namespace.
#[derive(Clone, Default)]
pub struct MemoryCoordination {
    namespace: Arc<Mutex<Namespace>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client with a fresh, connected session.
    pub async fn client(&self) -> Arc<MemoryCoordinationClient> {
        let session = self.namespace.lock().await.new_session();
        let (events, _) = broadcast::channel(64);
        Arc::new(MemoryCoordinationClient {
            namespace: self.namespace.clone(),
            session: AtomicU64::new(session),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            events,
        })
    }

    /// Raw read, bypassing any session.
    pub async fn get(&self, path: &str) -> Option<Bytes> {
        self.namespace
            .lock()
            .await
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }

    /// Raw delete, bypassing any session. Fires watches like a real delete.
    pub async fn remove(&self, path: &str) -> bool {
        let mut namespace = self.namespace.lock().await;
        if namespace.nodes.remove(path).is_some() {
            namespace.fire(path, WatchEventKind::Deleted);
            true
        } else {
            false
        }
    }

    /// Number of watches currently registered on `path`.
    pub async fn watch_count(&self, path: &str) -> usize {
        self.namespace
            .lock()
            .await
            .watches
            .get(path)
            .map(|entries| entries.iter().filter(|e| !e.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// One server's connection to a [`MemoryCoordination`].
pub struct MemoryCoordinationClient {
    namespace: Arc<Mutex<Namespace>>,
    session: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    stalled: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl MemoryCoordinationClient {
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check(&self) -> ClusterResult<u64> {
        if self.is_connected() {
            Ok(self.session_id())
        } else {
            Err(ClusterError::CoordinationUnavailable(format!(
                "session {} is disconnected",
                self.session_id()
            )))
        }
    }

    /// Make every call hang until [`resume`](Self::resume). No session event
    /// is sent and the session stays alive.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stalled.store(false, Ordering::SeqCst);
    }

    async fn wait_while_stalled(&self) {
        while self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drop the connection. The session and its ephemeral nodes stay alive.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    /// Re-establish the connection after [`disconnect`](Self::disconnect) or
    /// [`expire_session`](Self::expire_session).
    pub fn reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Connected);
        }
    }

    /// End the session: its ephemeral nodes and watches disappear. The client
    /// stays disconnected under a new session id until [`reconnect`](Self::reconnect).
    pub async fn expire_session(&self) {
        {
            let mut namespace = self.namespace.lock().await;
            let old = self.session_id();
            namespace.end_session(old);
            let new = namespace.new_session();
            self.session.store(new, Ordering::SeqCst);
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Expired);
    }

    /// Simulate a crash of the owning process.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        {
            let mut namespace = self.namespace.lock().await;
            namespace.end_session(self.session_id());
        }
        let _ = self.events.send(SessionEvent::Expired);
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinationClient {
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> ClusterResult<()> {
        self.wait_while_stalled().await;
        let session = self.check()?;
        let mut namespace = self.namespace.lock().await;
        let kind = if namespace.nodes.contains_key(path) {
            WatchEventKind::DataChanged
        } else {
            WatchEventKind::Created
        };
        namespace.nodes.insert(
            path.to_string(),
            Node {
                data,
                ephemeral_owner: Some(session),
            },
        );
        namespace.fire(path, kind);
        Ok(())
    }

    async fn create_if_absent(
        &self,
        path: &str,
        data: Bytes,
        ephemeral: bool,
    ) -> ClusterResult<bool> {
        self.wait_while_stalled().await;
        let session = self.check()?;
        let mut namespace = self.namespace.lock().await;
        if namespace.nodes.contains_key(path) {
            return Ok(false);
        }
        namespace.nodes.insert(
            path.to_string(),
            Node {
                data,
                ephemeral_owner: ephemeral.then_some(session),
            },
        );
        namespace.fire(path, WatchEventKind::Created);
        Ok(true)
    }

    async fn get_data(&self, path: &str) -> ClusterResult<Option<Bytes>> {
        self.wait_while_stalled().await;
        self.check()?;
        let namespace = self.namespace.lock().await;
        Ok(namespace.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn set_data(&self, path: &str, data: Bytes) -> ClusterResult<bool> {
        self.wait_while_stalled().await;
        self.check()?;
        let mut namespace = self.namespace.lock().await;
        match namespace.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                namespace.fire(path, WatchEventKind::DataChanged);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, path: &str) -> ClusterResult<()> {
        self.wait_while_stalled().await;
        self.check()?;
        let mut namespace = self.namespace.lock().await;
        if namespace.nodes.remove(path).is_some() {
            namespace.fire(path, WatchEventKind::Deleted);
        }
        Ok(())
    }

    async fn delete_if_equals(&self, path: &str, expected: &[u8]) -> ClusterResult<bool> {
        self.wait_while_stalled().await;
        self.check()?;
        let mut namespace = self.namespace.lock().await;
        let matches = namespace
            .nodes
            .get(path)
            .is_some_and(|node| node.data.as_ref() == expected);
        if matches {
            namespace.nodes.remove(path);
            namespace.fire(path, WatchEventKind::Deleted);
        }
        Ok(matches)
    }

    async fn list_children(&self, path: &str) -> ClusterResult<Vec<String>> {
        self.wait_while_stalled().await;
        self.check()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let namespace = self.namespace.lock().await;
        Ok(namespace
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let child = &key[prefix.len()..];
                (!child.is_empty() && !child.contains('/')).then(|| child.to_string())
            })
            .collect())
    }

    async fn watch(&self, path: &str) -> ClusterResult<oneshot::Receiver<WatchEvent>> {
        self.wait_while_stalled().await;
        let session = self.check()?;
        let (tx, rx) = oneshot::channel();
        let mut namespace = self.namespace.lock().await;
        let entries = namespace.watches.entry(path.to_string()).or_default();
        entries.retain(|entry| !entry.tx.is_closed());
        entries.push(WatchEntry { session, tx });
        Ok(rx)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
