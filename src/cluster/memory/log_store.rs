//! In-memory patch log store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::traits::LogStore;
use crate::types::{LogId, Patch, PatchLogInfo};

type PatchLog = Arc<Mutex<Vec<Patch>>>;

fn head_of(patches: &[Patch]) -> LogId {
    patches
        .last()
        .map(|patch| patch.id.clone())
        .unwrap_or_else(LogId::initial)
}

/// Patch logs held in memory, one lock per dataset.
#[derive(Default)]
pub struct MemoryLogStore {
    logs: DashMap<String, PatchLog>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, name: &str) -> ClusterResult<PatchLog> {
        self.logs
            .get(name)
            .map(|log| log.clone())
            .ok_or_else(|| ClusterError::UnknownDataset(name.to_string()))
    }

    /// Every patch of a dataset, in order.
    pub async fn patches(&self, name: &str) -> ClusterResult<Vec<Patch>> {
        let log = self.log(name)?;
        let patches = log.lock().await;
        Ok(patches.clone())
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn list(&self) -> ClusterResult<Vec<PatchLogInfo>> {
        let logs: Vec<(String, PatchLog)> = self
            .logs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut infos = Vec::with_capacity(logs.len());
        for (name, log) in logs {
            let head = head_of(&log.lock().await);
            infos.push(PatchLogInfo::new(name, head));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn create(&self, name: &str) -> ClusterResult<LogId> {
        match self.logs.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ClusterError::DatasetExists(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(Vec::new())));
                Ok(LogId::initial())
            }
        }
    }

    async fn info(&self, name: &str) -> ClusterResult<PatchLogInfo> {
        let log = self.log(name)?;
        let head = head_of(&log.lock().await);
        Ok(PatchLogInfo::new(name, head))
    }

    async fn append(
        &self,
        name: &str,
        patch: Patch,
        expected_head: Option<&LogId>,
    ) -> ClusterResult<LogId> {
        let log = self.log(name)?;
        let mut patches = log.lock().await;
        let head = head_of(&patches);

        if let Some(expected) = expected_head {
            if *expected != head {
                return Err(ClusterError::VersionConflict {
                    dataset: name.to_string(),
                    expected: expected.clone(),
                    actual: head,
                });
            }
        }
        if patches.iter().any(|existing| existing.id == patch.id) {
            return Err(ClusterError::DuplicatePatch {
                dataset: name.to_string(),
                id: patch.id,
            });
        }

        let new_head = patch.id.clone();
        patches.push(patch);
        Ok(new_head)
    }

    async fn get_patches(&self, name: &str, since: &LogId) -> ClusterResult<Vec<Patch>> {
        let log = self.log(name)?;
        let patches = log.lock().await;
        if since.is_initial() {
            return Ok(patches.clone());
        }
        match patches.iter().position(|patch| &patch.id == since) {
            Some(index) => Ok(patches[index + 1..].to_vec()),
            None => Err(ClusterError::PatchesUnavailable {
                dataset: name.to_string(),
                since: since.clone(),
            }),
        }
    }

    async fn get_patch(&self, name: &str, id: &LogId) -> ClusterResult<Option<Patch>> {
        let log = self.log(name)?;
        let patches = log.lock().await;
        Ok(patches.iter().find(|patch| &patch.id == id).cloned())
    }
}
