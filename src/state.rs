use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::db::RenewalDb;
use crate::types::Config;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "RENEWALSYNC_CONFIG";
/// Overrides `databasePath`.
pub const DB_ENV: &str = "RENEWALSYNC_DB";
/// Overrides `bindAddress`.
pub const BIND_ENV: &str = "RENEWALSYNC_BIND";

/// Shared application state handed to every HTTP handler.
pub struct AppState {
    pub config: Config,
    /// Connection for queries and overlay edits.
    pub db: Mutex<RenewalDb>,
    /// Connection owned by reconciliation runs, so a run never holds the
    /// lock request handlers wait on.
    pub sync_db: Mutex<RenewalDb>,
    /// Set while a reconciliation run holds the working table.
    sync_in_flight: AtomicBool,
}

impl AppState {
    pub fn new(config: Config, db: RenewalDb, sync_db: RenewalDb) -> Self {
        Self {
            config,
            db: Mutex::new(db),
            sync_db: Mutex::new(sync_db),
            sync_in_flight: AtomicBool::new(false),
        }
    }

    /// Claim the single sync slot. Returns `None` while another run holds it;
    /// the slot is released when the guard drops.
    pub fn try_begin_sync(&self) -> Option<SyncGuard<'_>> {
        self.sync_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard { state: self })
    }

    pub fn sync_in_flight(&self) -> bool {
        self.sync_in_flight.load(Ordering::Acquire)
    }
}

/// Holds the sync slot for the lifetime of one run.
pub struct SyncGuard<'a> {
    state: &'a AppState,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.state.sync_in_flight.store(false, Ordering::Release);
    }
}

/// Get the config file path: `$RENEWALSYNC_CONFIG` or `~/.renewalsync/config.json`.
pub fn config_path() -> Result<PathBuf, String> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".renewalsync").join("config.json"))
}

/// Where a loaded configuration came from. Loading happens before logging
/// is installed, so callers log this once the subscriber is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults(PathBuf),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => log::info!("Loaded config from {}", path.display()),
            ConfigSource::Defaults(path) => {
                log::info!("No config file at {}, using defaults", path.display())
            }
        }
    }
}

/// Load configuration and apply environment overrides.
///
/// A missing file yields defaults; a file that exists but does not parse is
/// an error.
pub fn load_config() -> Result<(Config, ConfigSource), String> {
    let path = config_path()?;
    let (mut config, source) = load_config_from(&path)?;
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok((config, source))
}

pub fn load_config_from(path: &Path) -> Result<(Config, ConfigSource), String> {
    if !path.exists() {
        return Ok((Config::default(), ConfigSource::Defaults(path.to_path_buf())));
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    let config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok((config, ConfigSource::File(path.to_path_buf())))
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(db) = lookup(DB_ENV).filter(|v| !v.trim().is_empty()) {
        config.database_path = Some(db);
    }
    if let Some(bind) = lookup(BIND_ENV).filter(|v| !v.trim().is_empty()) {
        config.bind_address = bind;
    }
}

/// Open the configured database, or the default `~/.renewalsync/renewals.db`.
pub fn open_database(config: &Config) -> Result<RenewalDb, String> {
    let result = match &config.database_path {
        Some(path) => RenewalDb::open_at(PathBuf::from(path)),
        None => RenewalDb::open(),
    };
    result.map_err(|e| format!("Failed to open renewals database: {}", e))
}
