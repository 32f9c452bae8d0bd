//! Process-local cache of "am I the leader of this dataset".
//!
//! The view is advisory. The leadership record in the coordination service is
//! the source of truth and the view may lag behind it. Request paths read the
//! view without locking; a stale "leader" answer is caught by the log store's
//! head check, a stale "not leader" answer by the fresh leader lookup done
//! before forwarding.
//!
//! Each dataset has its own `AtomicBool`, so a watch notification for one
//! dataset and a session reset never contend with reads of another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use super::metrics;

/// Lock-free per-dataset leadership flags.
#[derive(Debug, Default)]
pub struct LocalLeadershipView {
    flags: DashMap<String, Arc<AtomicBool>>,
}

impl LocalLeadershipView {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, dataset: &str) -> Arc<AtomicBool> {
        if let Some(flag) = self.flags.get(dataset) {
            return flag.clone();
        }
        self.flags
            .entry(dataset.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Cached answer. Unknown datasets are "not leader".
    #[inline]
    pub fn is_leader(&self, dataset: &str) -> bool {
        self.flags
            .get(dataset)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Set the flag. Returns whether the value changed.
    pub fn set(&self, dataset: &str, is_leader: bool) -> bool {
        let changed = self.flag(dataset).swap(is_leader, Ordering::SeqCst) != is_leader;
        if changed {
            metrics::set_datasets_led(self.leader_count());
        }
        changed
    }

    /// Flip every flag to "not leader". Returns the datasets that were led.
    pub fn reset_all(&self) -> Vec<String> {
        let mut lost: Vec<String> = self
            .flags
            .iter()
            .filter(|entry| entry.value().swap(false, Ordering::SeqCst))
            .map(|entry| entry.key().clone())
            .collect();
        lost.sort();
        metrics::set_datasets_led(self.leader_count());
        lost
    }

    /// Datasets this process currently believes it leads, sorted.
    pub fn led_datasets(&self) -> Vec<String> {
        let mut led: Vec<String> = self
            .flags
            .iter()
            .filter(|entry| entry.value().load(Ordering::SeqCst))
            .map(|entry| entry.key().clone())
            .collect();
        led.sort();
        led
    }

    pub fn leader_count(&self) -> usize {
        self.flags
            .iter()
            .filter(|entry| entry.value().load(Ordering::SeqCst))
            .count()
    }
}
