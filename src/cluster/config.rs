//! Configuration for a patch log cluster member.
//!
//! # Configuration Profiles
//!
//! ```rust,no_run
//! use patchlog_cluster::cluster::{ClusterConfig, ClusterProfile};
//!
//! // Development profile - short sync period for fast convergence in local runs
//! let dev_config = ClusterConfig::from_profile(ClusterProfile::Development);
//!
//! // Production profile - the defaults
//! let prod_config = ClusterConfig::from_profile(ClusterProfile::Production);
//! ```

use std::time::Duration;

use crate::constants::{
    DEFAULT_COORDINATION_TIMEOUT_MS, DEFAULT_NAMESPACE_ROOT, DEFAULT_PEER_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_MS, DEFAULT_SYNC_INTERVAL_MS,
};

use super::error::{ClusterError, ClusterResult};

/// Default port of a patch log server.
pub const DEFAULT_PORT: u16 = 1066;

/// Validated configuration profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterProfile {
    /// Local development and testing.
    ///
    /// Short sync period and tight timeouts so followers converge quickly
    /// and failures show up fast.
    ///
    /// **Not suitable for production use.**
    Development,

    /// Balanced configuration for production workloads.
    Production,
}

impl std::fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterProfile::Development => write!(f, "development"),
            ClusterProfile::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for ClusterProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ClusterProfile::Development),
            "production" | "prod" => Ok(ClusterProfile::Production),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production",
                s
            )),
        }
    }
}

/// Configuration for one server of the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Process-unique server id.
    pub server_id: String,

    /// Endpoint other servers use to reach this one.
    pub url: String,

    /// Root path of the coordination namespace.
    pub namespace_root: String,

    /// Bound on every coordination service call.
    pub coordination_timeout: Duration,

    /// Bound on every peer call.
    pub peer_timeout: Duration,

    /// Period of the reconciliation loop.
    pub sync_interval: Duration,

    /// Whether `start()` spawns the reconciliation loop.
    pub sync_enabled: bool,

    /// Time `stop()` allows background tasks to drain.
    pub shutdown_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_id: generate_server_id(),
            url: format!("http://127.0.0.1:{}", DEFAULT_PORT),
            namespace_root: DEFAULT_NAMESPACE_ROOT.to_string(),
            coordination_timeout: Duration::from_millis(DEFAULT_COORDINATION_TIMEOUT_MS),
            peer_timeout: Duration::from_millis(DEFAULT_PEER_TIMEOUT_MS),
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            sync_enabled: true,
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

/// Random server id for processes that are not given one.
fn generate_server_id() -> String {
    format!("server-{:016x}", fastrand::u64(..))
}

impl ClusterConfig {
    /// Create a config for a named server, everything else defaulted.
    pub fn new(server_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Build a config from a validated profile.
    pub fn from_profile(profile: ClusterProfile) -> Self {
        match profile {
            ClusterProfile::Development => Self {
                coordination_timeout: Duration::from_secs(2),
                peer_timeout: Duration::from_secs(3),
                sync_interval: Duration::from_secs(1),
                shutdown_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            ClusterProfile::Production => Self::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `SERVER_ID`: server id (default: random)
    /// - `SERVER_URL`: advertised endpoint (default: `http://127.0.0.1:1066`)
    /// - `COORDINATION_ROOT`: namespace root (default: `/patchlog`)
    /// - `COORDINATION_TIMEOUT_MS`, `PEER_TIMEOUT_MS`, `SYNC_INTERVAL_MS`,
    ///   `SHUTDOWN_TIMEOUT_MS`: durations in milliseconds
    /// - `SYNC_ENABLED`: `true`/`false` (default: `true`)
    pub fn from_env() -> ClusterResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> ClusterResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            server_id: lookup("SERVER_ID").unwrap_or(defaults.server_id),
            url: lookup("SERVER_URL").unwrap_or(defaults.url),
            namespace_root: lookup("COORDINATION_ROOT").unwrap_or(defaults.namespace_root),
            coordination_timeout: millis_var(
                &lookup,
                "COORDINATION_TIMEOUT_MS",
                defaults.coordination_timeout,
            )?,
            peer_timeout: millis_var(&lookup, "PEER_TIMEOUT_MS", defaults.peer_timeout)?,
            sync_interval: millis_var(&lookup, "SYNC_INTERVAL_MS", defaults.sync_interval)?,
            sync_enabled: match lookup("SYNC_ENABLED") {
                Some(value) => value.parse().map_err(|e| {
                    ClusterError::Config(format!("Invalid SYNC_ENABLED '{}': {}", value, e))
                })?,
                None => defaults.sync_enabled,
            },
            shutdown_timeout: millis_var(
                &lookup,
                "SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            )?,
        };

        config
            .validate()
            .map_err(|errors| ClusterError::Config(errors.join("; ")))?;
        Ok(config)
    }

    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server_id.trim().is_empty() {
            errors.push("server_id must not be empty".to_string());
        }
        if self.server_id.contains('/') {
            errors.push(format!(
                "server_id ({}) must not contain '/'",
                self.server_id
            ));
        }

        if self.url.trim().is_empty() {
            errors.push("url must not be empty".to_string());
        }

        if !self.namespace_root.starts_with('/') || self.namespace_root.ends_with('/') {
            errors.push(format!(
                "namespace_root ({}) must start with '/' and not end with '/'",
                self.namespace_root
            ));
        }

        if self.coordination_timeout.is_zero() {
            errors.push("coordination_timeout must be greater than zero".to_string());
        }
        if self.peer_timeout.is_zero() {
            errors.push("peer_timeout must be greater than zero".to_string());
        }

        // A sync round issues several peer calls; a period shorter than one
        // call would stack rounds behind a slow peer.
        if self.sync_enabled && self.sync_interval < self.peer_timeout / 10 {
            errors.push(format!(
                "sync_interval ({:?}) must be at least a tenth of peer_timeout ({:?})",
                self.sync_interval, self.peer_timeout
            ));
        }
        if self.sync_interval.is_zero() {
            errors.push("sync_interval must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn millis_var<F>(lookup: &F, key: &str, default: Duration) -> ClusterResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ClusterError::Config(format!("Invalid {} '{}': {}", key, value, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_cluster_config_default() {
        let config = ClusterConfig::default();
        assert!(config.server_id.starts_with("server-"));
        assert_eq!(config.url, "http://127.0.0.1:1066");
        assert_eq!(config.namespace_root, "/patchlog");
        assert_eq!(config.coordination_timeout, Duration::from_secs(5));
        assert_eq!(config.peer_timeout, Duration::from_secs(10));
        assert!(config.sync_enabled);
    }

    #[test]
    fn test_default_server_ids_are_unique() {
        assert_ne!(
            ClusterConfig::default().server_id,
            ClusterConfig::default().server_id
        );
    }

    #[test]
    fn test_validate_default_config_succeeds() {
        assert!(ClusterConfig::default().validate().is_ok());
        assert!(
            ClusterConfig::from_profile(ClusterProfile::Development)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_validate_empty_server_id_fails() {
        let config = ClusterConfig {
            server_id: "  ".to_string(),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("server_id")));
    }

    #[test]
    fn test_validate_bad_namespace_root_fails() {
        for root in ["patchlog", "/patchlog/"] {
            let config = ClusterConfig {
                namespace_root: root.to_string(),
                ..Default::default()
            };
            let errors = config.validate().unwrap_err();
            assert!(errors.iter().any(|e| e.contains("namespace_root")));
        }
    }

    #[test]
    fn test_validate_multiple_errors() {
        let config = ClusterConfig {
            server_id: "a/b".to_string(),
            url: String::new(),
            coordination_timeout: Duration::ZERO,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = ClusterConfig::from_lookup(lookup_from(&[
            ("SERVER_ID", "a"),
            ("SERVER_URL", "http://a:1066"),
            ("COORDINATION_ROOT", "/delta"),
            ("COORDINATION_TIMEOUT_MS", "1500"),
            ("SYNC_INTERVAL_MS", "2000"),
            ("SYNC_ENABLED", "false"),
        ]))
        .unwrap();

        assert_eq!(config.server_id, "a");
        assert_eq!(config.url, "http://a:1066");
        assert_eq!(config.namespace_root, "/delta");
        assert_eq!(config.coordination_timeout, Duration::from_millis(1500));
        assert_eq!(config.sync_interval, Duration::from_secs(2));
        assert!(!config.sync_enabled);
        assert_eq!(config.peer_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let err = ClusterConfig::from_lookup(lookup_from(&[("PEER_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ClusterError::Config(ref msg) if msg.contains("PEER_TIMEOUT_MS")));
    }

    #[test]
    fn test_from_lookup_validates() {
        let err = ClusterConfig::from_lookup(lookup_from(&[("COORDINATION_ROOT", "relative")]))
            .unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!(
            "dev".parse::<ClusterProfile>().unwrap(),
            ClusterProfile::Development
        );
        assert_eq!(
            "Production".parse::<ClusterProfile>().unwrap(),
            ClusterProfile::Production
        );
        assert!("fast".parse::<ClusterProfile>().is_err());
        assert_eq!(ClusterProfile::Development.to_string(), "development");
    }
}
