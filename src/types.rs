use serde::{Deserialize, Serialize};

/// Working table the reconciliation engine writes and the history ledger
/// is keyed by.
pub const WORKING_TABLE: &str = "zone_working";

/// Default number of history entries returned when the caller gives no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Upper bound on history entries returned by one request.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Service configuration, read from `~/.renewalsync/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// SQLite database file. Defaults to `~/.renewalsync/renewals.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Overlay columns whose upstream is not wired yet. Views return them as
    /// null and list them in `unavailable_fields`.
    #[serde(default)]
    pub unavailable_fields: Vec<String>,
    /// Expose `POST /api/seed`. Never enable in production.
    #[serde(default)]
    pub enable_seed: bool,
    /// Request header carrying the signed-in user's identity, set by the
    /// authentication proxy in front of this service.
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            bind_address: default_bind_address(),
            sync: SyncConfig::default(),
            history_limit: default_history_limit(),
            unavailable_fields: Vec::new(),
            enable_seed: false,
            identity_header: default_identity_header(),
            log_format: LogFormat::default(),
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
    /// Extra attempts for a row write that fails inside a run.
    #[serde(default = "default_row_retry_limit")]
    pub row_retry_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            orphan_policy: OrphanPolicy::default(),
            row_retry_limit: default_row_retry_limit(),
        }
    }
}

/// What reconciliation does with a working row whose source row is gone.
/// Working rows are never deleted by a run; overlay edits are human work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Leave the row exactly as it is.
    #[default]
    Retain,
    /// Stamp `source_missing_since` so the row can be reviewed.
    Flag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

fn default_row_retry_limit() -> u32 {
    1
}

/// The signed-in user performing a mutation. Supplied by the caller, never
/// read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}
