//! Shared data types for the patch log cluster.
//!
//! These types flow between the local log store, the coordination service
//! and peer servers. None of them interpret patch contents: a [`Patch`] is
//! moved around by its [`LogId`] and the id of the patch it was appended on.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Identifier of a patch, and therefore of a log head.
///
/// Log ids are opaque. Two ids can only be compared for equality; ordering
/// between patches comes from append chaining, never from the id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(Arc<str>);

impl LogId {
    /// Head of a log that has no patches yet.
    ///
    /// Every server creates new logs at this head, so independently created
    /// copies of a dataset start out identical.
    pub const INITIAL: &'static str = "id:nil";

    /// Create a log id from its string form.
    pub fn new(id: impl AsRef<str>) -> Self {
        LogId(Arc::from(id.as_ref()))
    }

    /// The head of an empty log.
    pub fn initial() -> Self {
        LogId::new(Self::INITIAL)
    }

    /// Whether this is the head of an empty log.
    #[inline]
    pub fn is_initial(&self) -> bool {
        &*self.0 == Self::INITIAL
    }

    /// Get the string form.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogId {
    fn from(value: &str) -> Self {
        LogId::new(value)
    }
}

impl From<String> for LogId {
    fn from(value: String) -> Self {
        LogId::new(value)
    }
}

/// A single patch in a dataset's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Identifier of this patch. Becomes the log head once appended.
    pub id: LogId,
    /// Head the patch was appended on. `None` for the first patch of a log.
    pub previous: Option<LogId>,
    /// Encoded patch body, never inspected by the cluster layer.
    pub payload: Bytes,
}

impl Patch {
    pub fn new(id: impl Into<LogId>, previous: Option<LogId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            previous,
            payload: payload.into(),
        }
    }

    /// Whether this patch directly follows `head` in a log.
    pub fn follows(&self, head: &LogId) -> bool {
        match &self.previous {
            Some(previous) => previous == head,
            None => head.is_initial(),
        }
    }
}

/// Name and current head of a patch log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchLogInfo {
    pub name: String,
    pub head: LogId,
}

impl PatchLogInfo {
    pub fn new(name: impl Into<String>, head: LogId) -> Self {
        Self {
            name: name.into(),
            head,
        }
    }
}

/// A server taking part in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Process-unique id.
    pub id: String,
    /// Endpoint other servers use to reach this one.
    pub url: String,
    /// Epoch millis of the last (re-)announcement.
    pub last_seen: i64,
}

impl ServerIdentity {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            last_seen: Utc::now().timestamp_millis(),
        }
    }

    /// Copy of this identity with `last_seen` set to now.
    pub fn refreshed(&self) -> Self {
        Self {
            last_seen: Utc::now().timestamp_millis(),
            ..self.clone()
        }
    }

    /// Whether two identities name the same server.
    #[inline]
    pub fn same_server(&self, other: &ServerIdentity) -> bool {
        self.id == other.id
    }
}

/// Cluster-visible record of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub name: String,
    pub head: LogId,
}

/// Ephemeral record naming the server allowed to append to a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipRecord {
    pub dataset: String,
    pub holder: ServerIdentity,
    /// Epoch millis of the election.
    pub won_at: i64,
}

impl LeadershipRecord {
    pub fn new(dataset: impl Into<String>, holder: ServerIdentity) -> Self {
        Self {
            dataset: dataset.into(),
            holder,
            won_at: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_log_id() {
        let id = LogId::initial();
        assert!(id.is_initial());
        assert_eq!(id.as_str(), LogId::INITIAL);
        assert!(!LogId::new("p1").is_initial());
    }

    #[test]
    fn test_log_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&LogId::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
        let back: LogId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LogId::new("abc"));
    }

    #[test]
    fn test_patch_follows() {
        let first = Patch::new("p1", None, "a");
        assert!(first.follows(&LogId::initial()));
        assert!(!first.follows(&LogId::new("p0")));

        let second = Patch::new("p2", Some(LogId::new("p1")), "b");
        assert!(second.follows(&LogId::new("p1")));
        assert!(!second.follows(&LogId::initial()));
    }

    #[test]
    fn test_server_identity_refreshed_keeps_identity() {
        let server = ServerIdentity {
            id: "a".to_string(),
            url: "http://a:1066".to_string(),
            last_seen: 0,
        };
        let refreshed = server.refreshed();
        assert!(refreshed.same_server(&server));
        assert!(refreshed.last_seen > 0);
    }
}
