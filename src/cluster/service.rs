//! Coordinated patch log service.
//!
//! [`CoordinatedLogService`] puts a local [`LogStore`] behind the cluster
//! directory:
//!
//! - writes run on the dataset's leader; other servers forward them there once
//! - reads are served locally and fall back to the leader when the local copy
//!   lacks the data
//! - a periodic reconciliation task pulls what followers are missing
//!
//! # Request routing
//!
//! ```text
//!   append(d) ──► local view says leader? ──yes──► local append ──► publish head
//!                        │ no
//!                        ▼
//!                 fresh leader lookup ──none──► NoLeader
//!                        │
//!            self ◄──────┴──────► other ──► forward once ──► result
//! ```
//!
//! A forwarded request is always answered by the receiving server's local
//! state ([`PeerHandler`]); it is never forwarded again, so two servers with
//! stale views cannot bounce a request between them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::types::{LogId, Patch, PatchLogInfo, ServerIdentity};

use super::background_tasks::{BackgroundTaskRegistry, TaskStatus};
use super::config::ClusterConfig;
use super::directory::{ClusterDirectory, LeadershipCallback};
use super::error::{ClusterError, ClusterResult};
use super::keys::validate_dataset_name;
use super::metrics;
use super::peer::{
    PeerClient, PeerHandler, PeerRequest, PeerResponse, PeerTransport, RemoteError,
};
use super::reconcile::{Reconciler, SyncReport};
use super::traits::{CoordinationClient, LogStore};

const RECONCILE_TASK: &str = "reconcile";

/// Point-in-time view of a running service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub server_id: String,
    pub url: String,
    pub running: bool,
    pub session_healthy: bool,
    pub datasets_led: Vec<String>,
    pub watched_datasets: Vec<String>,
    pub tasks: Vec<(String, TaskStatus)>,
}

impl ServiceStatus {
    /// Running with a live session and no finished background task.
    pub fn is_healthy(&self) -> bool {
        self.running
            && self.session_healthy
            && self
                .tasks
                .iter()
                .all(|(_, status)| status.is_healthy())
    }
}

fn log_leadership_changes(server_id: String) -> LeadershipCallback {
    Arc::new(move |dataset, is_leader| {
        if is_leader {
            info!(server_id = %server_id, dataset, "Now leading dataset");
        } else {
            info!(server_id = %server_id, dataset, "No longer leading dataset");
        }
    })
}

/// Map a failed forwarded call to what the original caller sees.
///
/// Errors decided by the leader's log pass through unchanged. Anything about
/// reaching the leader becomes a retryable forwarding error.
fn forwarding_error(
    dataset: &str,
    leader: &ServerIdentity,
    operation: &'static str,
    err: ClusterError,
) -> ClusterError {
    match err {
        ClusterError::VersionConflict { .. }
        | ClusterError::UnknownDataset(_)
        | ClusterError::DatasetExists(_)
        | ClusterError::PatchesUnavailable { .. }
        | ClusterError::DuplicatePatch { .. }
        | ClusterError::NoLeader { .. } => err,
        other => ClusterError::Forwarding {
            dataset: dataset.to_string(),
            leader: leader.id.clone(),
            operation,
            message: other.to_string(),
        },
    }
}

/// Where a request for a dataset should run.
enum Route {
    Local,
    Forward(ServerIdentity),
    NoLeader,
}

/// A [`LogStore`] made cluster-aware.
pub struct CoordinatedLogService<S: LogStore, C: CoordinationClient> {
    config: ClusterConfig,
    store: Arc<S>,
    directory: Arc<ClusterDirectory<C>>,
    transport: Arc<dyn PeerTransport>,
    reconciler: Arc<Reconciler<S, C>>,
    on_leadership_change: LeadershipCallback,
    tasks: Mutex<BackgroundTaskRegistry>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl<S, C> CoordinatedLogService<S, C>
where
    S: LogStore + 'static,
    C: CoordinationClient + 'static,
{
    pub fn new(
        config: ClusterConfig,
        store: Arc<S>,
        client: Arc<C>,
        transport: Arc<dyn PeerTransport>,
    ) -> ClusterResult<Self> {
        config
            .validate()
            .map_err(|errors| ClusterError::Config(errors.join("; ")))?;

        let directory = Arc::new(ClusterDirectory::new(client, &config));
        let on_leadership_change = log_leadership_changes(config.server_id.clone());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            directory.clone(),
            transport.clone(),
            config.peer_timeout,
            on_leadership_change.clone(),
        ));

        Ok(Self {
            config,
            store,
            directory,
            transport,
            reconciler,
            on_leadership_change,
            tasks: Mutex::new(BackgroundTaskRegistry::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn identity(&self) -> &ServerIdentity {
        self.directory.identity()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory<C>> {
        &self.directory
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    fn ensure_not_stopped(&self) -> ClusterResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(ClusterError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn peer(&self, target: ServerIdentity) -> PeerClient {
        PeerClient::new(self.transport.clone(), target, self.config.peer_timeout)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Join the cluster: register, follow every local dataset, start syncing.
    ///
    /// Calling `start` on a running service does nothing.
    pub async fn start(&self) -> ClusterResult<()> {
        self.ensure_not_stopped()?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.directory.start().await {
            self.running.store(false, Ordering::Release);
            error!(server_id = %self.identity().id, error = %e, "Failed to join cluster");
            return Err(e);
        }

        for info in self.store.list().await? {
            if let Err(e) = self.directory.register_dataset(&info.name, &info.head).await {
                warn!(dataset = %info.name, error = %e, "Failed to register local dataset");
            }
            if let Err(e) = self
                .directory
                .watch_leadership(&info.name, self.on_leadership_change.clone())
                .await
            {
                warn!(dataset = %info.name, error = %e, "Failed to install leadership watch");
            }
        }

        if self.config.sync_enabled {
            let reconciler = self.reconciler.clone();
            let spawned = self.tasks.lock().await.spawn_periodic(
                RECONCILE_TASK,
                self.config.sync_interval,
                move |_| {
                    let reconciler = reconciler.clone();
                    async move {
                        reconciler.run_round().await;
                    }
                },
            );
            if !spawned {
                return Err(ClusterError::ShuttingDown);
            }
        }

        info!(
            server_id = %self.identity().id,
            url = %self.identity().url,
            sync_enabled = self.config.sync_enabled,
            "Coordinated log service started"
        );
        Ok(())
    }

    /// Leave the cluster. Every step is best effort and `stop` always returns.
    ///
    /// Order: drain reconciliation, stop watches, resign led datasets,
    /// deregister. After `stop`, requests fail with `ShuttingDown`.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(server_id = %self.identity().id, "Stopping coordinated log service");

        self.tasks
            .lock()
            .await
            .shutdown_all_with_timeout(self.config.shutdown_timeout)
            .await;
        self.directory.shutdown().await;

        let led = self.directory.view().led_datasets();
        let results = join_all(led.iter().map(|dataset| self.directory.resign(dataset))).await;
        for (dataset, result) in led.iter().zip(results) {
            if let Err(e) = result {
                warn!(dataset = %dataset, error = %e, "Failed to resign leadership");
            }
        }

        if let Err(e) = self.directory.deregister_self().await {
            warn!(error = %e, "Failed to deregister server");
        }
        self.running.store(false, Ordering::Release);
        info!(server_id = %self.identity().id, resigned = led.len(), "Coordinated log service stopped");
    }

    /// Run one reconciliation round now.
    pub async fn reconcile_once(&self) -> ClusterResult<SyncReport> {
        self.ensure_not_stopped()?;
        Ok(self.reconciler.run_round().await)
    }

    pub async fn status(&self) -> ServiceStatus {
        let mut tasks = self.tasks.lock().await.health_check();
        tasks.extend(self.directory.task_health().await);
        tasks.sort_by(|a, b| a.0.cmp(&b.0));

        ServiceStatus {
            server_id: self.identity().id.clone(),
            url: self.identity().url.clone(),
            running: self.is_running(),
            session_healthy: self.directory.session().is_healthy(),
            datasets_led: self.directory.view().led_datasets(),
            watched_datasets: self.directory.watched_datasets().await,
            tasks,
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Datasets held locally.
    pub async fn list_patch_logs(&self) -> ClusterResult<Vec<PatchLogInfo>> {
        self.ensure_not_stopped()?;
        self.store.list().await
    }

    /// Local head of a dataset. Never forwarded; may lag the leader.
    pub async fn get_patch_log_info(&self, name: &str) -> ClusterResult<PatchLogInfo> {
        self.ensure_not_stopped()?;
        self.store.info(name).await
    }

    /// Current leader according to the coordination service.
    pub async fn get_dataset_leader(&self, name: &str) -> ClusterResult<Option<ServerIdentity>> {
        self.ensure_not_stopped()?;
        validate_dataset_name(name)?;
        self.directory.get_leader(name).await
    }

    /// Patches after `since`, from the leader if the local copy lacks them.
    pub async fn get_patches(&self, name: &str, since: &LogId) -> ClusterResult<Vec<Patch>> {
        self.ensure_not_stopped()?;
        let local_err = match self.store.get_patches(name, since).await {
            Ok(patches) => return Ok(patches),
            Err(e) if e.is_missing_locally() => e,
            Err(e) => return Err(e),
        };

        match self.read_route(name).await? {
            Route::Forward(leader) => {
                debug!(dataset = name, leader = %leader.id, since = %since, "Reading patches from leader");
                let result = self.peer(leader.clone()).get_patches(name, since).await;
                metrics::record_forward("get_patches", result.as_ref().err());
                result.map_err(|e| forwarding_error(name, &leader, "get_patches", e))
            }
            Route::Local | Route::NoLeader => Err(local_err),
        }
    }

    /// One patch by id, from the leader if it is not held locally.
    ///
    /// A patch fetched from the leader is appended locally when it directly
    /// follows the local head.
    pub async fn get_patch(&self, name: &str, id: &LogId) -> ClusterResult<Option<Patch>> {
        self.ensure_not_stopped()?;
        let local = match self.store.get_patch(name, id).await {
            Ok(Some(patch)) => return Ok(Some(patch)),
            Ok(None) => Ok(None),
            Err(e) if e.is_missing_locally() => Err(e),
            Err(e) => return Err(e),
        };

        let leader = match self.read_route(name).await? {
            Route::Forward(leader) => leader,
            Route::Local | Route::NoLeader => return local,
        };

        debug!(dataset = name, leader = %leader.id, patch = %id, "Reading patch from leader");
        let result = self.peer(leader.clone()).get_patch(name, id).await;
        metrics::record_forward("get_patch", result.as_ref().err());
        let fetched = result.map_err(|e| forwarding_error(name, &leader, "get_patch", e))?;

        if let Some(patch) = &fetched {
            self.cache_patch(name, patch).await;
        }
        Ok(fetched)
    }

    async fn read_route(&self, name: &str) -> ClusterResult<Route> {
        if self.directory.view().is_leader(name) {
            return Ok(Route::Local);
        }
        match self.directory.get_leader(name).await? {
            Some(leader) if leader.same_server(self.identity()) => Ok(Route::Local),
            Some(leader) => Ok(Route::Forward(leader)),
            None => Ok(Route::NoLeader),
        }
    }

    async fn cache_patch(&self, name: &str, patch: &Patch) {
        let head = match self.store.info(name).await {
            Ok(info) => info.head,
            Err(ClusterError::UnknownDataset(_)) => return,
            Err(e) => {
                metrics::PATCH_CACHE_FAILURES.inc();
                warn!(dataset = name, error = %e, "Failed to read local head for caching");
                return;
            }
        };
        if !patch.follows(&head) {
            debug!(dataset = name, patch = %patch.id, head = %head, "Fetched patch does not follow local head");
            return;
        }
        match self.store.append(name, patch.clone(), Some(&head)).await {
            Ok(_) => debug!(dataset = name, patch = %patch.id, "Cached patch from leader"),
            Err(e) => {
                metrics::PATCH_CACHE_FAILURES.inc();
                warn!(dataset = name, patch = %patch.id, error = %e, "Failed to cache patch from leader");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Create a dataset here, make it known to the cluster and try to lead it.
    pub async fn create_patch_log(&self, name: &str) -> ClusterResult<LogId> {
        self.ensure_not_stopped()?;
        validate_dataset_name(name)?;

        let head = self.store.create(name).await?;
        self.directory.register_dataset(name, &head).await?;
        self.directory
            .watch_leadership(name, self.on_leadership_change.clone())
            .await?;
        // Installing the watch runs the election for a leaderless dataset.
        let leads = self.directory.view().is_leader(name);

        info!(dataset = name, head = %head, leads, "Created patch log");
        Ok(head)
    }

    /// Append a patch on the dataset's leader.
    ///
    /// With `expected_head`, the append only succeeds if the leader's head
    /// still equals it. Forwarded at most once.
    pub async fn append(
        &self,
        name: &str,
        patch: Patch,
        expected_head: Option<LogId>,
    ) -> ClusterResult<LogId> {
        self.ensure_not_stopped()?;
        validate_dataset_name(name)?;

        match self.write_route(name).await? {
            Route::Local => self.append_locally(name, patch, expected_head.as_ref()).await,
            Route::NoLeader => {
                let err = ClusterError::NoLeader {
                    dataset: name.to_string(),
                };
                metrics::record_append(false, Some(&err));
                Err(err)
            }
            Route::Forward(leader) => {
                debug!(dataset = name, leader = %leader.id, patch = %patch.id, "Forwarding append");
                let result = self.peer(leader.clone()).append(name, patch, expected_head).await;
                metrics::record_append(true, result.as_ref().err());
                metrics::record_forward("append", result.as_ref().err());
                result.map_err(|e| forwarding_error(name, &leader, "append", e))
            }
        }
    }

    async fn write_route(&self, name: &str) -> ClusterResult<Route> {
        if self.directory.view().is_leader(name) {
            return Ok(Route::Local);
        }
        match self.directory.get_leader(name).await? {
            Some(leader) if leader.same_server(self.identity()) => {
                if self.directory.session().is_healthy() {
                    self.directory.view().set(name, true);
                    Ok(Route::Local)
                } else {
                    Ok(Route::NoLeader)
                }
            }
            Some(leader) => Ok(Route::Forward(leader)),
            None => Ok(Route::NoLeader),
        }
    }

    async fn append_locally(
        &self,
        name: &str,
        patch: Patch,
        expected_head: Option<&LogId>,
    ) -> ClusterResult<LogId> {
        let patch_id = patch.id.clone();
        let head = match self.store.append(name, patch, expected_head).await {
            Ok(head) => head,
            Err(e) => {
                metrics::record_append(false, Some(&e));
                debug!(dataset = name, patch = %patch_id, error = %e, "Local append rejected");
                return Err(e);
            }
        };
        metrics::record_append(false, None);

        if let Err(e) = self.directory.update_dataset_head(name, &head).await {
            metrics::HEAD_PUBLISH_FAILURES.inc();
            warn!(dataset = name, head = %head, error = %e, "Failed to publish new head");
        }
        debug!(dataset = name, head = %head, "Appended patch");
        Ok(head)
    }

    async fn serve_forwarded_append(
        &self,
        dataset: &str,
        patch: Patch,
        expected_head: Option<LogId>,
    ) -> ClusterResult<LogId> {
        self.ensure_not_stopped()?;
        let leads = self.directory.view().is_leader(dataset)
            || self.directory.is_leader(dataset).await?;
        if !leads {
            return Err(ClusterError::NotLeader {
                dataset: dataset.to_string(),
                server_id: self.identity().id.clone(),
            });
        }
        self.append_locally(dataset, patch, expected_head.as_ref()).await
    }
}

#[async_trait]
impl<S, C> PeerHandler for CoordinatedLogService<S, C>
where
    S: LogStore + 'static,
    C: CoordinationClient + 'static,
{
    async fn handle_peer_request(&self, request: PeerRequest) -> PeerResponse {
        let operation = request.operation();
        let dataset = request.dataset().map(str::to_string);
        if self.stopped.load(Ordering::Acquire) {
            return PeerResponse::Error {
                error: RemoteError::ShuttingDown,
            };
        }

        let response = match request {
            PeerRequest::ListDatasets => PeerResponse::from_result(self.store.list().await, |infos| {
                PeerResponse::Datasets {
                    datasets: infos.into_iter().map(|info| info.name).collect(),
                }
            }),
            PeerRequest::DatasetVersion { dataset } => {
                PeerResponse::from_result(self.store.info(&dataset).await, |info| {
                    PeerResponse::Version { head: info.head }
                })
            }
            PeerRequest::GetPatches { dataset, since } => PeerResponse::from_result(
                self.store.get_patches(&dataset, &since).await,
                |patches| PeerResponse::Patches { patches },
            ),
            PeerRequest::GetPatch { dataset, id } => PeerResponse::from_result(
                self.store.get_patch(&dataset, &id).await,
                |patch| PeerResponse::Patch { patch },
            ),
            PeerRequest::Append {
                dataset,
                patch,
                expected_head,
            } => PeerResponse::from_result(
                self.serve_forwarded_append(&dataset, patch, expected_head).await,
                |head| PeerResponse::Appended { head },
            ),
        };

        if let PeerResponse::Error { error } = &response {
            debug!(operation, dataset = ?dataset, ?error, "Peer request failed");
        }
        response
    }
}
