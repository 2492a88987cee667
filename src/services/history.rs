// History service
// Append-only ledger of reconciliation runs.

use crate::db::{NewSyncHistory, RenewalDb, SyncHistoryEntry};
use crate::error::ServiceError;
use crate::types::MAX_HISTORY_LIMIT;
use crate::workflow::reconcile::SyncOutcome;

/// Append the history entry for a finished run. Returns the entry id.
pub fn record_run(db: &RenewalDb, outcome: &SyncOutcome) -> Result<i64, ServiceError> {
    let details = outcome.error_details();
    let entry = NewSyncHistory {
        run_id: &outcome.run_id,
        table_name: &outcome.table_name,
        status: outcome.status,
        started_at: &outcome.started_at,
        finished_at: &outcome.finished_at,
        rows_inserted: outcome.inserted as i64,
        rows_updated: outcome.updated as i64,
        rows_deleted: outcome.deleted as i64,
        rows_unchanged: outcome.unchanged as i64,
        rows_orphaned: outcome.orphaned as i64,
        rows_failed: outcome.failed as i64,
        error_details: details.as_ref(),
    };
    db.insert_sync_history(&entry)
        .map_err(|e| ServiceError::store("record_run", e))
}

/// Most recent runs for `table_name`, newest first.
///
/// `limit` falls back to `default_limit` and is clamped to `1..=100`.
pub fn list_recent(
    db: &RenewalDb,
    table_name: &str,
    limit: Option<usize>,
    default_limit: usize,
) -> Result<Vec<SyncHistoryEntry>, ServiceError> {
    let limit = clamp_limit(limit, default_limit);
    db.get_recent_sync_history(table_name, limit)
        .map_err(|e| ServiceError::store("list_sync_history", e))
}

pub fn clamp_limit(limit: Option<usize>, default_limit: usize) -> usize {
    limit.unwrap_or(default_limit).clamp(1, MAX_HISTORY_LIMIT)
}
