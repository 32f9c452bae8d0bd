//! Coordination session state shared by everything that depends on leadership.
//!
//! Losing the coordination session is the one event after which this process
//! cannot tell whether it still leads anything. Instead of every dataset
//! polling the coordination service on its own, the directory's session
//! monitor turns each session event into:
//!
//! 1. a transition of [`SessionState`] (lost / healthy)
//! 2. a bump of the session generation, which wakes every leadership watch task
//!
//! Watch tasks subscribe to the generation and re-derive their status from the
//! coordination service after every bump.
//!
//! # Example
//!
//! ```rust
//! use patchlog_cluster::cluster::session::SessionState;
//!
//! let session = SessionState::new();
//! assert!(session.is_healthy());
//!
//! assert!(session.mark_lost());
//! let lost_at = session.lost_at();
//!
//! // ... re-register with the coordination service ...
//! assert!(session.try_recover(lost_at));
//! assert!(session.is_healthy());
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::watch;

use super::metrics;

/// Session health flag plus a generation counter bumped on every session event.
#[derive(Debug)]
pub struct SessionState {
    lost: AtomicBool,
    /// Epoch millis of the last loss, 0 while healthy.
    lost_at_millis: AtomicU64,
    generation: watch::Sender<u64>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            lost: AtomicBool::new(false),
            lost_at_millis: AtomicU64::new(0),
            generation,
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    pub fn lost_at(&self) -> u64 {
        self.lost_at_millis.load(Ordering::SeqCst)
    }

    /// Mark the session lost. Returns `true` on the healthy -> lost transition.
    pub fn mark_lost(&self) -> bool {
        if !self.lost.swap(true, Ordering::SeqCst) {
            let now = Utc::now().timestamp_millis().max(1) as u64;
            self.lost_at_millis.store(now, Ordering::SeqCst);
            metrics::SESSION_LOST.set(1);
            true
        } else {
            false
        }
    }

    /// Mark the session healthy unless it was lost again since `expected_lost_at`.
    ///
    /// Recovery work (re-registering this server) runs between observing the
    /// loss and calling this; a second loss during that window must win.
    pub fn try_recover(&self, expected_lost_at: u64) -> bool {
        if self.lost_at_millis.load(Ordering::SeqCst) != expected_lost_at {
            return false;
        }

        match self
            .lost
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.lost_at_millis.store(0, Ordering::SeqCst);
                metrics::SESSION_LOST.set(0);
                true
            }
            Err(_) => false,
        }
    }

    /// Wake every subscriber.
    pub fn bump(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
            next = *generation;
        });
        next
    }

    /// Receiver that observes every later [`bump`](Self::bump).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
