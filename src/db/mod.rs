//! SQLite-backed store for the renewals source ledger, the CRM working table,
//! quotes, and the sync history ledger.
//!
//! The database lives at `~/.renewalsync/renewals.db` unless configured
//! otherwise. `zone_original` is written only by the upstream feed (or the
//! seed endpoint in non-production environments); everything else is owned
//! by this crate.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;

pub mod quotes;
pub mod renewals;
pub mod sync_history;
pub mod types;
pub use renewals::OverlayUpdate;
pub use types::*;

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RenewalDb {
    conn: Connection,
    /// `None` for in-memory databases.
    path: Option<PathBuf>,
}

impl RenewalDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Execute a closure inside a named savepoint. On Err only the work done
    /// since the savepoint is undone; the enclosing transaction stays open.
    pub fn with_savepoint<F, T>(&self, name: &str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(val)
            }
            Err(e) => {
                let _ = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"));
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default location and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets presentation reads proceed while a sync run holds the writer.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        // Quotes cascade with their parent renewal.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        log::info!("Opened renewals database at {}", path.display());
        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Open an in-memory database with the full schema.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open another connection to the same database file. Each connection
    /// serializes its own callers; WAL lets readers on one proceed while
    /// another holds the write transaction.
    pub fn reopen(&self) -> Result<Self, DbError> {
        match &self.path {
            Some(path) => Self::open_at(path.clone()),
            None => Err(DbError::InMemory),
        }
    }

    /// Resolve the default database path: `~/.renewalsync/renewals.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".renewalsync").join("renewals.db"))
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use super::*;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    pub fn test_db() -> RenewalDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        RenewalDb::open_at(path).expect("Failed to open test database")
    }

    pub fn source_row(policy_id: &str, client_name: &str, invoice_total: f64) -> SourceRenewal {
        SourceRenewal {
            policy_id: policy_id.to_string(),
            client_code: Some(format!("C-{policy_id}")),
            client_name: Some(client_name.to_string()),
            lob: Some("Property".to_string()),
            expiry_date: Some("2025-03-15".to_string()),
            invoice_total: Some(invoice_total),
            status: false,
            comments: None,
        }
    }

    /// Insert a working row assigned to `account_manager`, bypassing reconciliation.
    pub fn working_row(
        db: &RenewalDb,
        policy_id: &str,
        account_manager: &str,
        now: &str,
    ) -> WorkingRenewal {
        let renewal = WorkingRenewal {
            policy_id: policy_id.to_string(),
            source: SourceFields {
                client_name: Some(format!("Client {policy_id}")),
                invoice_total: Some(1000.0),
                expiry_date: Some("2025-04-01".to_string()),
                ..SourceFields::default()
            },
            overlay: OverlayFields {
                account_manager: Some(account_manager.to_string()),
                ..OverlayFields::default()
            },
            source_missing_since: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        };
        db.upsert_working_renewal(&renewal)
            .expect("seed working renewal");
        renewal
    }
}

// =============================================================================
// Tests
// =============================================================================
