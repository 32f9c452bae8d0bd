//! Centralized defaults for cluster coordination.
//!
//! # Categories
//!
//! - **Namespace**: layout of the coordination service namespace
//! - **Timeouts**: bounds on every blocking network call
//! - **Background**: reconciliation and shutdown timing

// =============================================================================
// Namespace
// =============================================================================

/// Default root of the coordination namespace.
pub const DEFAULT_NAMESPACE_ROOT: &str = "/patchlog";

/// Child of the root holding one ephemeral node per live server.
pub const SERVERS_NODE: &str = "servers";

/// Child of the root holding one persistent node per dataset.
pub const DATASETS_NODE: &str = "datasets";

/// Child of the root holding one ephemeral leadership node per led dataset.
pub const LEADERS_NODE: &str = "leaders";

// =============================================================================
// Timeouts
// =============================================================================

/// Bound on a single coordination service call.
pub const DEFAULT_COORDINATION_TIMEOUT_MS: u64 = 5_000;

/// Bound on a single peer call (forwarded request or sync fetch).
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Background
// =============================================================================

/// Period of the reconciliation loop.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 10_000;

/// Time `stop()` allows background tasks to drain before aborting them.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Delay before a watch task retries after a coordination failure.
pub const WATCH_RETRY_DELAY_MS: u64 = 250;

/// How often a directory whose session is marked lost tries to re-register.
pub const SESSION_RECOVERY_INTERVAL_MS: u64 = 250;
