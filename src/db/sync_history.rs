use rusqlite::params;

use super::*;

impl RenewalDb {
    // =========================================================================
    // Sync history (append-only)
    // =========================================================================

    /// Append one run record. There is no update or delete
    /// counterpart; the schema's triggers reject both.
    pub fn insert_sync_history(&self, entry: &NewSyncHistory<'_>) -> Result<i64, DbError> {
        let error_details = entry
            .error_details
            .map(serde_json::to_string)
            .transpose()
            .map_err(|source| DbError::Encode {
                what: "sync error details",
                source,
            })?;
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO sync_history (
                run_id, table_name, status, started_at, finished_at,
                rows_inserted, rows_updated, rows_deleted, rows_unchanged,
                rows_orphaned, rows_failed, error_details, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.run_id,
                entry.table_name,
                entry.status,
                entry.started_at,
                entry.finished_at,
                entry.rows_inserted,
                entry.rows_updated,
                entry.rows_deleted,
                entry.rows_unchanged,
                entry.rows_orphaned,
                entry.rows_failed,
                error_details,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent runs for a table, newest first.
    pub fn get_recent_sync_history(
        &self,
        table_name: &str,
        limit: usize,
    ) -> Result<Vec<SyncHistoryEntry>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, table_name, status, started_at, finished_at,
                    rows_inserted, rows_updated, rows_deleted, rows_unchanged,
                    rows_orphaned, rows_failed, error_details, created_at
             FROM sync_history
             WHERE table_name = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![table_name, limit as i64], |row| {
            let details: Option<String> = row.get(12)?;
            Ok(SyncHistoryEntry {
                id: row.get(0)?,
                run_id: row.get(1)?,
                table_name: row.get(2)?,
                status: row.get(3)?,
                started_at: row.get(4)?,
                finished_at: row.get(5)?,
                rows_inserted: row.get(6)?,
                rows_updated: row.get(7)?,
                rows_deleted: row.get(8)?,
                rows_unchanged: row.get(9)?,
                rows_orphaned: row.get(10)?,
                rows_failed: row.get(11)?,
                // A payload that no longer parses is still worth showing verbatim.
                error_details: details.map(|raw| {
                    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
                }),
                created_at: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn entry<'a>(run_id: &'a str, table: &'a str, status: SyncStatus) -> NewSyncHistory<'a> {
        NewSyncHistory {
            run_id,
            table_name: table,
            status,
            started_at: "2025-01-01T00:00:00+00:00",
            finished_at: "2025-01-01T00:00:01+00:00",
            rows_inserted: 1,
            rows_updated: 2,
            rows_deleted: 0,
            rows_unchanged: 3,
            rows_orphaned: 0,
            rows_failed: 0,
            error_details: None,
        }
    }

    #[test]
    fn test_recent_history_newest_first_and_scoped() {
        let db = test_db();
        db.insert_sync_history(&entry("run-1", "zone_working", SyncStatus::Success))
            .unwrap();
        db.insert_sync_history(&entry("run-2", "other_table", SyncStatus::Success))
            .unwrap();
        db.insert_sync_history(&entry("run-3", "zone_working", SyncStatus::Partial))
            .unwrap();

        let history = db.get_recent_sync_history("zone_working", 10).unwrap();
        let runs: Vec<_> = history.iter().map(|h| h.run_id.as_str()).collect();
        assert_eq!(runs, vec!["run-3", "run-1"]);
        assert_eq!(history[0].status, SyncStatus::Partial);

        let limited = db.get_recent_sync_history("zone_working", 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].run_id, "run-3");
    }

    #[test]
    fn test_error_details_round_trip_as_json() {
        let db = test_db();
        let details = serde_json::json!({ "message": "boom", "rows": [] });
        let mut failed = entry("run-1", "zone_working", SyncStatus::Failed);
        failed.error_details = Some(&details);
        db.insert_sync_history(&failed).unwrap();

        let history = db.get_recent_sync_history("zone_working", 1).unwrap();
        assert_eq!(history[0].error_details.as_ref(), Some(&details));
    }

    #[test]
    fn test_history_rejects_update_and_delete() {
        let db = test_db();
        db.insert_sync_history(&entry("run-1", "zone_working", SyncStatus::Success))
            .unwrap();

        let update = db
            .conn_ref()
            .execute("UPDATE sync_history SET rows_inserted = 99", []);
        assert!(update.is_err(), "history rows must be immutable");

        let delete = db.conn_ref().execute("DELETE FROM sync_history", []);
        assert!(delete.is_err(), "history rows must not be deletable");

        let history = db.get_recent_sync_history("zone_working", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].rows_inserted, 1);
    }
}
