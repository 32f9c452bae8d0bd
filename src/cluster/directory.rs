//! Cluster membership and per-dataset leader election.
//!
//! The directory is the only component that talks to the coordination
//! service. It owns three pieces of process state:
//!
//! - the [`LocalLeadershipView`] read by request paths
//! - the [`SessionState`] shared by every leadership watch
//! - a [`BackgroundTaskRegistry`] with one watch task per dataset and the
//!   session monitor
//!
//! # Election
//!
//! Leadership is an ephemeral record created with an atomic create-if-absent.
//! Whoever creates it leads until its session ends. Nothing in this module
//! ever checks and then creates.
//!
//! # Per-dataset state
//!
//! ```text
//! NoOpinion -> Follower -> AttemptingLeadership -> Leader
//!                 ^                |                 |
//!                 +----- lost -----+---- session ----+
//! ```
//!
//! A leader only becomes a follower through an observed change: its record
//! disappeared, or its session was lost. It never assumes it still leads after
//! a session problem; it re-reads the record once the session is back.
//!
//! # Watches
//!
//! Each watched dataset gets a task that loops:
//!
//! 1. register a one-shot watch on the leadership record
//! 2. read the record, attempting election if it is absent
//! 3. report a change to the callback if the record or the local status differ
//!    from the previous observation
//! 4. wait for the watch to fire or the session generation to change
//!
//! Registering before reading means no change between two notifications can
//! go unnoticed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::constants::{SESSION_RECOVERY_INTERVAL_MS, WATCH_RETRY_DELAY_MS};
use crate::types::{DatasetRecord, LeadershipRecord, LogId, ServerIdentity};

use super::background_tasks::{BackgroundTaskRegistry, TaskStatus};
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::keys::{Keys, validate_dataset_name};
use super::leadership_view::LocalLeadershipView;
use super::metrics;
use super::retry;
use super::session::SessionState;
use super::traits::{CoordinationClient, SessionEvent, WatchEvent};

/// Invoked with `(dataset, is_leader)` after every observed leadership change.
///
/// The observation made while a watch is installed is the baseline and is not
/// reported, even when that observation includes winning an election. Callers
/// read the outcome of installation from [`LocalLeadershipView::is_leader`].
pub type LeadershipCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

const SESSION_MONITOR_TASK: &str = "session_monitor";
const WATCH_TASK_PREFIX: &str = "watch:";

fn watch_task_name(dataset: &str) -> String {
    format!("{}{}", WATCH_TASK_PREFIX, dataset)
}

fn encode<T: Serialize>(value: &T) -> ClusterResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> ClusterResult<T> {
    Ok(serde_json::from_slice(data)?)
}

/// State shared between the directory and its background tasks.
struct DirectoryContext<C: CoordinationClient> {
    client: Arc<C>,
    keys: Keys,
    identity: ServerIdentity,
    view: Arc<LocalLeadershipView>,
    session: Arc<SessionState>,
    coordination_timeout: Duration,
}

impl<C: CoordinationClient> DirectoryContext<C> {
    /// Run one coordination call under the coordination timeout.
    ///
    /// A call that cannot reach the coordination service drops every local
    /// leadership, exactly like a lost session.
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> ClusterResult<T>
    where
        F: Future<Output = ClusterResult<T>>,
    {
        let err = match tokio::time::timeout(self.coordination_timeout, call).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_coordination_failure() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => ClusterError::CoordinationUnavailable(format!(
                "{} timed out after {}ms",
                operation,
                self.coordination_timeout.as_millis()
            )),
        };
        metrics::record_coordination_failure(operation);
        if self.session.is_healthy() {
            warn!(operation, error = %err, "Coordination service unreachable");
            self.session_lost("unreachable", false);
        }
        Err(err)
    }

    /// Drop every local leadership and wake the watch tasks.
    ///
    /// With `always_notify` unset, only the healthy -> lost transition wakes
    /// the watch tasks, so repeated failures cannot spin them.
    fn session_lost(&self, reason: &'static str, always_notify: bool) {
        metrics::record_session_event(reason);
        let transitioned = self.session.mark_lost();
        let lost = self.view.reset_all();
        if lost.is_empty() {
            warn!(reason, "Coordination session lost");
        } else {
            error!(reason, datasets = ?lost, "Coordination session lost, dropped all leaderships");
        }
        if transitioned || always_notify {
            self.session.bump();
        }
    }

    fn is_self(&self, holder: &ServerIdentity) -> bool {
        holder.same_server(&self.identity)
    }

    async fn register_self(&self) -> ClusterResult<ServerIdentity> {
        let identity = self.identity.refreshed();
        let path = self.keys.server(&identity.id);
        let data = encode(&identity)?;
        self.bounded("register_self", self.client.create_ephemeral(&path, data))
            .await?;
        debug!(server_id = %identity.id, url = %identity.url, "Registered server");
        Ok(identity)
    }

    async fn raw_leader_record(&self, dataset: &str) -> ClusterResult<Option<Bytes>> {
        let path = self.keys.leader(dataset);
        self.bounded("get_leader", self.client.get_data(&path)).await
    }

    async fn leader_record(&self, dataset: &str) -> ClusterResult<Option<LeadershipRecord>> {
        match self.raw_leader_record(dataset).await? {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }

    async fn try_become_leader(&self, dataset: &str) -> ClusterResult<bool> {
        let record = LeadershipRecord::new(dataset, self.identity.refreshed());
        let path = self.keys.leader(dataset);
        let data = encode(&record)?;

        let created = self
            .bounded(
                "try_become_leader",
                self.client.create_if_absent(&path, data, true),
            )
            .await?;

        metrics::record_election(created);
        if created {
            self.view.set(dataset, true);
            info!(dataset, server_id = %self.identity.id, "Won leadership");
        } else {
            debug!(dataset, "Leadership record already exists");
        }
        Ok(created)
    }

    /// One watch iteration: arm the watch, then read (and maybe claim) the record.
    async fn observe(
        &self,
        dataset: &str,
    ) -> ClusterResult<(Option<LeadershipRecord>, oneshot::Receiver<WatchEvent>)> {
        let path = self.keys.leader(dataset);
        let rx = self.bounded("watch", self.client.watch(&path)).await?;

        let mut record = self.leader_record(dataset).await?;
        if record.is_none() && self.session.is_healthy() {
            self.try_become_leader(dataset).await?;
            record = self.leader_record(dataset).await?;
        }
        Ok((record, rx))
    }
}

/// What a watch task saw last.
#[derive(Default)]
struct WatchState {
    record: Option<Option<LeadershipRecord>>,
    is_leader: Option<bool>,
}

impl WatchState {
    /// Record an observation. Returns whether it differs from the previous one.
    fn update(&mut self, record: Option<LeadershipRecord>, is_leader: bool) -> bool {
        let changed = match (&self.record, self.is_leader) {
            (Some(previous), Some(was_leader)) => previous != &record || was_leader != is_leader,
            _ => false,
        };
        self.record = Some(record);
        self.is_leader = Some(is_leader);
        changed
    }
}

async fn run_watch<C: CoordinationClient>(
    ctx: Arc<DirectoryContext<C>>,
    dataset: String,
    callback: LeadershipCallback,
    mut state: WatchState,
    mut pending: Option<oneshot::Receiver<WatchEvent>>,
    mut generation: watch::Receiver<u64>,
) {
    let retry_delay = Duration::from_millis(WATCH_RETRY_DELAY_MS);

    loop {
        if let Some(rx) = pending.take() {
            // A dropped sender means the session ended; re-read either way.
            tokio::select! {
                _ = rx => {}
                _ = generation.changed() => {}
            }
        }

        match ctx.observe(&dataset).await {
            Ok((record, rx)) => {
                let is_leader = record
                    .as_ref()
                    .is_some_and(|current| ctx.is_self(&current.holder))
                    && ctx.session.is_healthy();
                ctx.view.set(&dataset, is_leader);

                let holder = record.as_ref().map(|current| current.holder.id.clone());
                if state.update(record, is_leader) {
                    debug!(dataset = %dataset, ?holder, is_leader, "Leadership changed");
                    metrics::LEADERSHIP_NOTIFICATIONS.inc();
                    callback(dataset.as_str(), is_leader);
                }
                pending = Some(rx);
            }
            Err(e) => {
                warn!(dataset = %dataset, error = %e, "Leadership watch failed, retrying");
                if state.is_leader == Some(true) {
                    ctx.view.set(&dataset, false);
                    state.is_leader = Some(false);
                    metrics::LEADERSHIP_NOTIFICATIONS.inc();
                    callback(dataset.as_str(), false);
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = generation.changed() => {}
                }
            }
        }
    }
}

async fn run_session_monitor<C: CoordinationClient>(
    ctx: Arc<DirectoryContext<C>>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    let recovery_interval = Duration::from_millis(SESSION_RECOVERY_INTERVAL_MS);

    loop {
        // A lost session with no event to announce its return (a stalled
        // service rather than a dropped connection) is recovered by re-registering.
        let received = if ctx.session.is_healthy() {
            events.recv().await
        } else {
            tokio::select! {
                received = events.recv() => received,
                _ = tokio::time::sleep(recovery_interval) => {
                    check_session_recovered(&ctx).await;
                    continue;
                }
            }
        };

        let event = match received {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Unknown what was missed; assume the worst and re-derive.
                warn!(skipped, "Session monitor lagged behind session events");
                ctx.session_lost("lagged", true);
                handle_session_connected(&ctx).await;
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Session event stream closed");
                break;
            }
        };

        match event {
            SessionEvent::Disconnected => ctx.session_lost("disconnected", true),
            SessionEvent::Expired => ctx.session_lost("expired", true),
            SessionEvent::Connected => {
                metrics::record_session_event("connected");
                handle_session_connected(&ctx).await;
            }
        }
    }
}

/// One re-registration attempt while the session is marked lost.
async fn check_session_recovered<C: CoordinationClient>(ctx: &Arc<DirectoryContext<C>>) {
    let lost_at = ctx.session.lost_at();
    match ctx.register_self().await {
        Ok(_) => {
            if ctx.session.try_recover(lost_at) {
                metrics::record_session_event("recovered");
                info!(server_id = %ctx.identity.id, "Coordination service reachable again");
                ctx.session.bump();
            }
        }
        Err(e) => debug!(error = %e, "Coordination service still unreachable"),
    }
}

async fn handle_session_connected<C: CoordinationClient>(ctx: &Arc<DirectoryContext<C>>) {
    let lost_at = ctx.session.lost_at();
    match retry::with_coordinator_policy("register_self", || ctx.register_self()).await {
        Ok(_) => {
            if ctx.session.try_recover(lost_at) {
                info!(server_id = %ctx.identity.id, "Coordination session re-established");
            }
        }
        Err(e) => {
            error!(server_id = %ctx.identity.id, error = %e, "Failed to re-register after reconnect");
        }
    }
    ctx.session.bump();
}

/// Membership, dataset records and leader election on top of a [`CoordinationClient`].
pub struct ClusterDirectory<C: CoordinationClient> {
    ctx: Arc<DirectoryContext<C>>,
    tasks: Mutex<BackgroundTaskRegistry>,
    shutdown_timeout: Duration,
}

impl<C: CoordinationClient + 'static> ClusterDirectory<C> {
    pub fn new(client: Arc<C>, config: &ClusterConfig) -> Self {
        let ctx = DirectoryContext {
            client,
            keys: Keys::new(config.namespace_root.clone()),
            identity: ServerIdentity::new(config.server_id.clone(), config.url.clone()),
            view: Arc::new(LocalLeadershipView::new()),
            session: Arc::new(SessionState::new()),
            coordination_timeout: config.coordination_timeout,
        };
        Self {
            ctx: Arc::new(ctx),
            tasks: Mutex::new(BackgroundTaskRegistry::new()),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.ctx.identity
    }

    pub fn keys(&self) -> &Keys {
        &self.ctx.keys
    }

    pub fn view(&self) -> &Arc<LocalLeadershipView> {
        &self.ctx.view
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.ctx.session
    }

    /// Register this server and start following session events.
    pub async fn start(&self) -> ClusterResult<ServerIdentity> {
        let events = self.ctx.client.session_events();
        let ctx = self.ctx.clone();
        if !self
            .tasks
            .lock()
            .await
            .spawn(SESSION_MONITOR_TASK, run_session_monitor(ctx, events))
        {
            return Err(ClusterError::ShuttingDown);
        }
        self.register_self().await
    }

    /// Create or refresh this server's ephemeral membership entry.
    pub async fn register_self(&self) -> ClusterResult<ServerIdentity> {
        self.ctx.register_self().await
    }

    /// Remove this server's membership entry.
    pub async fn deregister_self(&self) -> ClusterResult<()> {
        let path = self.ctx.keys.server(&self.ctx.identity.id);
        self.ctx
            .bounded("deregister_self", self.ctx.client.delete(&path))
            .await
    }

    /// Snapshot of registered servers, sorted by id.
    ///
    /// Entries that vanish between listing and reading are skipped.
    pub async fn list_servers(&self) -> ClusterResult<Vec<ServerIdentity>> {
        let parent = self.ctx.keys.servers();
        let children = self
            .ctx
            .bounded("list_servers", self.ctx.client.list_children(&parent))
            .await?;

        let mut servers = Vec::with_capacity(children.len());
        for child in children {
            let path = self.ctx.keys.server(&child);
            let Some(data) = self
                .ctx
                .bounded("list_servers", self.ctx.client.get_data(&path))
                .await?
            else {
                continue;
            };
            match decode::<ServerIdentity>(&data) {
                Ok(server) => servers.push(server),
                Err(e) => warn!(server_id = %child, error = %e, "Skipping unreadable server entry"),
            }
        }
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    /// Registered servers other than this one.
    pub async fn list_peers(&self) -> ClusterResult<Vec<ServerIdentity>> {
        let mut servers = self.list_servers().await?;
        servers.retain(|server| !self.ctx.is_self(server));
        Ok(servers)
    }

    /// Make a dataset known to the cluster.
    ///
    /// Idempotent: an existing record is left untouched, since its head is
    /// owned by the dataset's leader. Returns whether the record was created.
    pub async fn register_dataset(&self, name: &str, head: &LogId) -> ClusterResult<bool> {
        validate_dataset_name(name)?;
        let record = DatasetRecord {
            name: name.to_string(),
            head: head.clone(),
        };
        let path = self.ctx.keys.dataset(name);
        let created = self
            .ctx
            .bounded(
                "register_dataset",
                self.ctx.client.create_if_absent(&path, encode(&record)?, false),
            )
            .await?;
        if created {
            info!(dataset = name, head = %head, "Registered dataset");
        }
        Ok(created)
    }

    /// Publish a new head. Does not check leadership; the append path does.
    pub async fn update_dataset_head(&self, name: &str, head: &LogId) -> ClusterResult<()> {
        let record = DatasetRecord {
            name: name.to_string(),
            head: head.clone(),
        };
        let path = self.ctx.keys.dataset(name);
        let data = encode(&record)?;
        let updated = self
            .ctx
            .bounded(
                "update_dataset_head",
                self.ctx.client.set_data(&path, data.clone()),
            )
            .await?;
        if !updated {
            self.ctx
                .bounded(
                    "update_dataset_head",
                    self.ctx.client.create_if_absent(&path, data, false),
                )
                .await?;
        }
        Ok(())
    }

    /// The cluster-visible record of a dataset, if any.
    pub async fn dataset_record(&self, name: &str) -> ClusterResult<Option<DatasetRecord>> {
        let path = self.ctx.keys.dataset(name);
        match self
            .ctx
            .bounded("dataset_record", self.ctx.client.get_data(&path))
            .await?
        {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Attempt to become leader with one atomic create-if-absent.
    ///
    /// Returns `true` iff this call created the leadership record. An existing
    /// record, including one this server already holds, yields `false`; use
    /// [`is_leader`](Self::is_leader) to ask who holds it.
    pub async fn try_become_leader(&self, name: &str) -> ClusterResult<bool> {
        validate_dataset_name(name)?;
        self.ctx.try_become_leader(name).await
    }

    /// Fresh check against the coordination service. Updates the local view.
    pub async fn is_leader(&self, name: &str) -> ClusterResult<bool> {
        let is_leader = match self.ctx.leader_record(name).await {
            Ok(record) => {
                record.is_some_and(|current| self.ctx.is_self(&current.holder))
                    && self.ctx.session.is_healthy()
            }
            Err(e) => {
                self.ctx.view.set(name, false);
                return Err(e);
            }
        };
        self.ctx.view.set(name, is_leader);
        Ok(is_leader)
    }

    /// Current leader of a dataset, if one is elected.
    pub async fn get_leader(&self, name: &str) -> ClusterResult<Option<ServerIdentity>> {
        Ok(self
            .ctx
            .leader_record(name)
            .await?
            .map(|record| record.holder))
    }

    /// The full leadership record of a dataset.
    pub async fn leader_record(&self, name: &str) -> ClusterResult<Option<LeadershipRecord>> {
        self.ctx.leader_record(name).await
    }

    /// Give up leadership of a dataset if this server holds it.
    ///
    /// Only the exact record this server wrote is deleted, so a successor
    /// elected in the meantime is never removed.
    pub async fn resign(&self, name: &str) -> ClusterResult<bool> {
        self.ctx.view.set(name, false);
        let Some(data) = self.ctx.raw_leader_record(name).await? else {
            return Ok(false);
        };
        let record: LeadershipRecord = decode(&data)?;
        if !self.ctx.is_self(&record.holder) {
            return Ok(false);
        }

        let path = self.ctx.keys.leader(name);
        let deleted = self
            .ctx
            .bounded("resign", self.ctx.client.delete_if_equals(&path, &data))
            .await?;
        if deleted {
            info!(dataset = name, "Resigned leadership");
        }
        Ok(deleted)
    }

    /// Follow leadership of a dataset.
    ///
    /// The first observation (including an election attempt if the dataset is
    /// leaderless) happens before this returns and sets the baseline; the
    /// callback then fires once for every later change. Watching a dataset
    /// again replaces the previous callback.
    pub async fn watch_leadership(&self, name: &str, callback: LeadershipCallback) -> ClusterResult<()> {
        validate_dataset_name(name)?;

        let mut state = WatchState::default();
        let pending = match self.ctx.observe(name).await {
            Ok((record, rx)) => {
                let is_leader = record
                    .as_ref()
                    .is_some_and(|current| self.ctx.is_self(&current.holder))
                    && self.ctx.session.is_healthy();
                self.ctx.view.set(name, is_leader);
                state.update(record, is_leader);
                Some(rx)
            }
            Err(e) => {
                warn!(dataset = name, error = %e, "Initial leadership read failed, watch will retry");
                None
            }
        };

        let generation = self.ctx.session.subscribe();
        let task = run_watch(
            self.ctx.clone(),
            name.to_string(),
            callback,
            state,
            pending,
            generation,
        );
        if self.tasks.lock().await.spawn(watch_task_name(name), task) {
            Ok(())
        } else {
            Err(ClusterError::ShuttingDown)
        }
    }

    /// Datasets with an installed leadership watch, sorted.
    pub async fn watched_datasets(&self) -> Vec<String> {
        self.tasks
            .lock()
            .await
            .health_check()
            .into_iter()
            .filter_map(|(name, _)| name.strip_prefix(WATCH_TASK_PREFIX).map(str::to_string))
            .collect()
    }

    pub async fn is_watching(&self, name: &str) -> bool {
        self.tasks.lock().await.is_running(&watch_task_name(name))
    }

    pub async fn task_health(&self) -> Vec<(String, TaskStatus)> {
        self.tasks.lock().await.health_check()
    }

    /// Stop the session monitor and every watch task.
    pub async fn shutdown(&self) {
        self.tasks
            .lock()
            .await
            .shutdown_all_with_timeout(self.shutdown_timeout)
            .await;
    }
}
