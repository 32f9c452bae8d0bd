//! Background reconciliation of follower logs.
//!
//! Every round pulls from each peer the datasets and patches this server is
//! missing. Leaders never pull: they are the source of their datasets' heads.
//! One failing peer or dataset is logged and skipped; it never aborts the
//! round.
//!
//! A dataset first seen on a peer stays out of leader election until one pull
//! for it succeeds. An empty copy that won an election would accept appends
//! that fork the log away from the copy it was meant to follow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use tracing::{debug, info, warn};

use crate::types::{LogId, ServerIdentity};

use super::directory::{ClusterDirectory, LeadershipCallback};
use super::error::{ClusterError, ClusterResult};
use super::keys::validate_dataset_name;
use super::metrics;
use super::peer::{PeerClient, PeerTransport};
use super::traits::{CoordinationClient, LogStore};

/// Outcome of one reconciliation round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub peers_synced: usize,
    pub peers_failed: usize,
    pub datasets_created: usize,
    pub patches_applied: usize,
}

/// Pulls missing datasets and patches from peers.
pub(crate) struct Reconciler<S: LogStore, C: CoordinationClient> {
    store: Arc<S>,
    directory: Arc<ClusterDirectory<C>>,
    transport: Arc<dyn PeerTransport>,
    peer_timeout: Duration,
    on_leadership_change: LeadershipCallback,
    /// Created from a peer, not yet caught up, not yet registered or watched.
    catching_up: DashSet<String>,
}

impl<S: LogStore + 'static, C: CoordinationClient + 'static> Reconciler<S, C> {
    pub(crate) fn new(
        store: Arc<S>,
        directory: Arc<ClusterDirectory<C>>,
        transport: Arc<dyn PeerTransport>,
        peer_timeout: Duration,
        on_leadership_change: LeadershipCallback,
    ) -> Self {
        Self {
            store,
            directory,
            transport,
            peer_timeout,
            on_leadership_change,
            catching_up: DashSet::new(),
        }
    }

    /// Whether `dataset` was discovered on a peer and is still waiting to be caught up.
    pub(crate) fn is_catching_up(&self, dataset: &str) -> bool {
        self.catching_up.contains(dataset)
    }

    /// Run one round against every registered peer.
    pub(crate) async fn run_round(&self) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::default();

        let mut local_heads: HashMap<String, LogId> = match self.store.list().await {
            Ok(infos) => infos.into_iter().map(|info| (info.name, info.head)).collect(),
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped: cannot list local datasets");
                metrics::record_sync_round(started.elapsed().as_secs_f64(), 0, 0);
                return report;
            }
        };

        for dataset in local_heads.keys() {
            if !self.is_catching_up(dataset) {
                self.ensure_watch(dataset).await;
            }
        }

        let peers = match self.directory.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped: cannot list peers");
                metrics::record_sync_round(started.elapsed().as_secs_f64(), 0, 0);
                return report;
            }
        };

        for peer in peers {
            match self.sync_peer(&peer, &mut local_heads, &mut report).await {
                Ok(()) => report.peers_synced += 1,
                Err(e) => {
                    report.peers_failed += 1;
                    let err = match e {
                        ClusterError::SyncPeer { .. } => e,
                        other => ClusterError::SyncPeer {
                            peer: peer.id.clone(),
                            message: other.to_string(),
                        },
                    };
                    warn!(peer = %peer.id, error = %err, "Reconciliation with peer failed");
                }
            }
        }

        metrics::SYNC_DATASETS_CREATED.inc_by(report.datasets_created as u64);
        metrics::record_sync_round(
            started.elapsed().as_secs_f64(),
            report.peers_failed,
            report.patches_applied,
        );
        debug!(?report, "Reconciliation round finished");
        report
    }

    async fn ensure_watch(&self, dataset: &str) {
        if self.directory.is_watching(dataset).await {
            return;
        }
        if let Err(e) = self
            .directory
            .watch_leadership(dataset, self.on_leadership_change.clone())
            .await
        {
            warn!(dataset, error = %e, "Failed to install leadership watch");
        }
    }

    async fn sync_peer(
        &self,
        peer: &ServerIdentity,
        local_heads: &mut HashMap<String, LogId>,
        report: &mut SyncReport,
    ) -> ClusterResult<()> {
        let client = PeerClient::new(self.transport.clone(), peer.clone(), self.peer_timeout);
        let datasets = client.list_datasets().await?;

        let mut failed = 0;
        for dataset in &datasets {
            if let Err(e) = self.sync_dataset(&client, dataset, local_heads, report).await {
                failed += 1;
                warn!(peer = %peer.id, dataset = %dataset, error = %e, "Failed to sync dataset");
            }
        }

        if failed > 0 {
            return Err(ClusterError::SyncPeer {
                peer: peer.id.clone(),
                message: format!("{} of {} datasets failed", failed, datasets.len()),
            });
        }
        Ok(())
    }

    async fn sync_dataset(
        &self,
        client: &PeerClient,
        dataset: &str,
        local_heads: &mut HashMap<String, LogId>,
        report: &mut SyncReport,
    ) -> ClusterResult<()> {
        if let Err(e) = validate_dataset_name(dataset) {
            warn!(peer = %client.target().id, dataset, error = %e, "Ignoring dataset with invalid name");
            return Ok(());
        }

        let local_head = match local_heads.get(dataset) {
            Some(head) => head.clone(),
            None => {
                let head = self.create_local(dataset, report).await?;
                local_heads.insert(dataset.to_string(), head.clone());
                head
            }
        };

        if self.directory.view().is_leader(dataset) {
            return Ok(());
        }

        self.pull(client, dataset, local_head, local_heads, report)
            .await?;

        if self.catching_up.remove(dataset).is_some() {
            let head = local_heads
                .get(dataset)
                .cloned()
                .unwrap_or_else(LogId::initial);
            if let Err(e) = self.directory.register_dataset(dataset, &head).await {
                warn!(dataset, error = %e, "Failed to register discovered dataset");
            }
            self.ensure_watch(dataset).await;
            info!(dataset, head = %head, "Discovered dataset caught up");
        }
        Ok(())
    }

    async fn pull(
        &self,
        client: &PeerClient,
        dataset: &str,
        local_head: LogId,
        local_heads: &mut HashMap<String, LogId>,
        report: &mut SyncReport,
    ) -> ClusterResult<()> {
        let remote_head = client.dataset_version(dataset).await?;
        if remote_head == local_head {
            return Ok(());
        }
        if remote_head.is_initial() || self.store.get_patch(dataset, &remote_head).await?.is_some() {
            debug!(peer = %client.target().id, dataset, "Peer is behind, nothing to pull");
            return Ok(());
        }

        let patches = client.get_patches(dataset, &local_head).await?;
        for patch in patches {
            let id = patch.id.clone();
            match self.store.append(dataset, patch, None).await {
                Ok(head) => {
                    report.patches_applied += 1;
                    local_heads.insert(dataset.to_string(), head);
                }
                Err(ClusterError::DuplicatePatch { .. }) => {
                    debug!(dataset, patch = %id, "Patch already present");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create_local(&self, dataset: &str, report: &mut SyncReport) -> ClusterResult<LogId> {
        match self.store.create(dataset).await {
            Ok(head) => {
                report.datasets_created += 1;
                self.catching_up.insert(dataset.to_string());
                info!(dataset, "Created dataset discovered on peer");
                Ok(head)
            }
            Err(ClusterError::DatasetExists(_)) => Ok(self.store.info(dataset).await?.head),
            Err(e) => Err(e),
        }
    }
}
