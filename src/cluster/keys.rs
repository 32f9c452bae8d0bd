//! Path layout of the coordination namespace.
//!
//! ```text
//! {root}/servers/{server_id}   ephemeral  ServerIdentity
//! {root}/datasets/{name}       persistent DatasetRecord
//! {root}/leaders/{name}        ephemeral  LeadershipRecord
//! ```
//!
//! Dataset names are used as a single path segment, so they are validated
//! before any path is built from them.

use crate::constants::{DATASETS_NODE, LEADERS_NODE, SERVERS_NODE};

use super::error::{ClusterError, ClusterResult};

/// Maximum length of a dataset name.
pub const MAX_DATASET_NAME_LEN: usize = 255;

/// Path builder bound to one namespace root.
#[derive(Debug, Clone)]
pub struct Keys {
    root: String,
}

impl Keys {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// Parent of all server membership nodes.
    pub fn servers(&self) -> String {
        format!("{}/{}", self.root, SERVERS_NODE)
    }

    pub fn server(&self, server_id: &str) -> String {
        format!("{}/{}/{}", self.root, SERVERS_NODE, server_id)
    }

    pub fn dataset(&self, name: &str) -> String {
        format!("{}/{}/{}", self.root, DATASETS_NODE, name)
    }

    pub fn leader(&self, name: &str) -> String {
        format!("{}/{}/{}", self.root, LEADERS_NODE, name)
    }
}

/// Validate a dataset name for use as a namespace segment.
pub fn validate_dataset_name(name: &str) -> ClusterResult<()> {
    let invalid = |reason: String| {
        Err(ClusterError::InvalidDatasetName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("must not be empty".to_string());
    }
    if name.len() > MAX_DATASET_NAME_LEN {
        return invalid(format!("exceeds {} bytes", MAX_DATASET_NAME_LEN));
    }
    if name == "." || name == ".." {
        return invalid("reserved".to_string());
    }
    if name.chars().any(|c| c == '/' || c.is_control()) {
        return invalid("contains '/' or control characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let keys = Keys::new("/patchlog");
        assert_eq!(keys.servers(), "/patchlog/servers");
        assert_eq!(keys.server("a"), "/patchlog/servers/a");
        assert_eq!(keys.dataset("orders"), "/patchlog/datasets/orders");
        assert_eq!(keys.leader("orders"), "/patchlog/leaders/orders");
    }

    #[test]
    fn test_validate_dataset_name() {
        assert!(validate_dataset_name("orders").is_ok());
        assert!(validate_dataset_name("orders-2024.v1").is_ok());
        assert!(validate_dataset_name("").is_err());
        assert!(validate_dataset_name("..").is_err());
        assert!(matches!(
            validate_dataset_name("a/b"),
            Err(ClusterError::InvalidDatasetName { ref name, .. }) if name == "a/b"
        ));
        assert!(validate_dataset_name("a\nb").is_err());
        assert!(validate_dataset_name(&"x".repeat(256)).is_err());
    }
}
