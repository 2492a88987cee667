//! Source → working reconciliation.
//!
//! Merges `zone_original` into `zone_working` by `policy_id`:
//! - new source rows are inserted with overlay defaults
//! - existing rows get their source-owned group refreshed when it differs
//! - working rows missing from the source are orphans, handled per
//!   `OrphanPolicy` and never deleted
//!
//! Overlay columns are never written here. Every run, whatever its result,
//! appends one `sync_history` entry.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{DbError, RenewalDb, SourceFields, SourceRenewal, SyncStatus, WorkingRenewal};
use crate::error::ServiceError;
use crate::services::history;
use crate::types::{OrphanPolicy, SyncConfig, WORKING_TABLE};

/// Savepoint wrapping each row write.
const ROW_SAVEPOINT: &str = "reconcile_row";

// =============================================================================
// Source feed
// =============================================================================

/// Where source rows come from. The production feed is the `zone_original`
/// table in the same database.
pub trait SourceFeed {
    /// Name used in logs and failure messages.
    fn name(&self) -> &str;

    /// Read the full source set, in feed order.
    fn fetch_all(&self) -> Result<Vec<SourceRenewal>, DbError>;
}

impl SourceFeed for RenewalDb {
    fn name(&self) -> &str {
        "zone_original"
    }

    fn fetch_all(&self) -> Result<Vec<SourceRenewal>, DbError> {
        self.get_all_source_renewals()
    }
}

// =============================================================================
// Options and outcome
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub orphan_policy: OrphanPolicy,
    /// Extra attempts per failing row write.
    pub row_retry_limit: u32,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for ReconcileOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            orphan_policy: config.orphan_policy,
            row_retry_limit: config.row_retry_limit,
        }
    }
}

/// A row that could not be written (or was rejected before writing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    pub policy_id: String,
    pub operation: String,
    pub message: String,
    pub attempts: u32,
}

/// Result of one reconciliation run. Returned for every run; a failed run
/// carries `error` and zero write counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub run_id: String,
    pub table_name: String,
    pub status: SyncStatus,
    pub started_at: String,
    pub finished_at: String,
    pub inserted: usize,
    pub updated: usize,
    /// Always zero: runs never delete working rows.
    pub deleted: usize,
    pub unchanged: usize,
    pub orphaned: usize,
    pub failed: usize,
    pub row_errors: Vec<RowFailure>,
    pub error: Option<String>,
    /// `sync_history.id` of the entry recorded for this run.
    pub history_id: Option<i64>,
}

impl SyncOutcome {
    fn started(run_id: String, started_at: String) -> Self {
        Self {
            run_id,
            table_name: WORKING_TABLE.to_string(),
            status: SyncStatus::Success,
            started_at: started_at.clone(),
            finished_at: started_at,
            inserted: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            orphaned: 0,
            failed: 0,
            row_errors: Vec::new(),
            error: None,
            history_id: None,
        }
    }

    /// Row writes the run tried, successful or not.
    pub fn attempted(&self) -> usize {
        self.inserted + self.updated + self.failed
    }

    /// Human-readable one-liner for responses and logs.
    pub fn summary(&self) -> String {
        match self.status {
            SyncStatus::Success => format!(
                "Synced {}: {} inserted, {} updated, {} unchanged, {} orphaned",
                self.table_name, self.inserted, self.updated, self.unchanged, self.orphaned
            ),
            SyncStatus::Partial => format!(
                "Synced {} with errors: {} inserted, {} updated, {} failed",
                self.table_name, self.inserted, self.updated, self.failed
            ),
            SyncStatus::Failed => format!(
                "Sync of {} failed: {}",
                self.table_name,
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    /// The error a caller should surface for this outcome, if any.
    pub fn to_error(&self) -> Option<ServiceError> {
        match self.status {
            SyncStatus::Success => None,
            SyncStatus::Partial => Some(ServiceError::PartialSync {
                failed: self.failed,
                attempted: self.attempted(),
            }),
            SyncStatus::Failed => Some(ServiceError::UpstreamStore {
                operation: "reconcile",
                source: DbError::Reported(self.error.clone().unwrap_or_default()),
            }),
        }
    }

    /// Structured payload stored in `sync_history.error_details`.
    pub fn error_details(&self) -> Option<serde_json::Value> {
        match self.status {
            SyncStatus::Success => None,
            SyncStatus::Partial => Some(serde_json::json!({
                "message": self.summary(),
                "rows": self.row_errors,
            })),
            SyncStatus::Failed => Some(serde_json::json!({
                "message": self.error,
                "rows": self.row_errors,
            })),
        }
    }
}

// =============================================================================
// Planning
// =============================================================================

/// One write the run intends to make.
#[derive(Debug, Clone, PartialEq)]
pub enum RowAction {
    Insert {
        policy_id: String,
        fields: SourceFields,
    },
    /// Overwrite the source-owned group (also clears an orphan marker).
    Refresh {
        policy_id: String,
        fields: SourceFields,
    },
    FlagOrphan {
        policy_id: String,
    },
}

impl RowAction {
    pub fn policy_id(&self) -> &str {
        match self {
            RowAction::Insert { policy_id, .. }
            | RowAction::Refresh { policy_id, .. }
            | RowAction::FlagOrphan { policy_id } => policy_id,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            RowAction::Insert { .. } => "insert",
            RowAction::Refresh { .. } => "update",
            RowAction::FlagOrphan { .. } => "flag_orphan",
        }
    }
}

#[derive(Debug, Default)]
pub struct MergePlan {
    pub actions: Vec<RowAction>,
    pub unchanged: usize,
    pub orphaned: usize,
    /// Source rows that can never be merged (blank or duplicate key).
    pub rejected: Vec<RowFailure>,
}

/// Diff the source set against the working set. Pure; touches no store.
pub fn plan_merge(
    source: &[SourceRenewal],
    working: &[WorkingRenewal],
    orphan_policy: OrphanPolicy,
) -> MergePlan {
    let existing: HashMap<&str, &WorkingRenewal> = working
        .iter()
        .map(|w| (w.policy_id.as_str(), w))
        .collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(source.len());
    let mut plan = MergePlan::default();

    for row in source {
        let policy_id = row.policy_id.trim();
        if policy_id.is_empty() {
            plan.rejected.push(rejected(&row.policy_id, "source row has a blank policy_id"));
            continue;
        }
        if !seen.insert(row.policy_id.as_str()) {
            plan.rejected.push(rejected(
                &row.policy_id,
                "duplicate policy_id in source; first occurrence kept",
            ));
            continue;
        }

        let fields = SourceFields::from_source(row);
        match existing.get(row.policy_id.as_str()) {
            None => plan.actions.push(RowAction::Insert {
                policy_id: row.policy_id.clone(),
                fields,
            }),
            Some(current) if current.source != fields || current.source_missing_since.is_some() => {
                plan.actions.push(RowAction::Refresh {
                    policy_id: row.policy_id.clone(),
                    fields,
                })
            }
            Some(_) => plan.unchanged += 1,
        }
    }

    for row in working {
        if seen.contains(row.policy_id.as_str()) {
            continue;
        }
        plan.orphaned += 1;
        if orphan_policy == OrphanPolicy::Flag && row.source_missing_since.is_none() {
            plan.actions.push(RowAction::FlagOrphan {
                policy_id: row.policy_id.clone(),
            });
        }
    }

    plan
}

fn rejected(policy_id: &str, message: &str) -> RowFailure {
    RowFailure {
        policy_id: policy_id.to_string(),
        operation: "validate".to_string(),
        message: message.to_string(),
        attempts: 0,
    }
}

// =============================================================================
// Execution
// =============================================================================

#[derive(Debug, Default)]
struct RunTally {
    inserted: usize,
    updated: usize,
    unchanged: usize,
    orphaned: usize,
    failures: Vec<RowFailure>,
}

/// Reconcile the working table against the `zone_original` table of the
/// same database.
pub fn reconcile(db: &RenewalDb, options: &ReconcileOptions) -> SyncOutcome {
    run_reconciliation(db, db, options)
}

/// Run one reconciliation and record it in the history ledger.
///
/// Never returns an error: a run that could not read its inputs or commit
/// comes back with `SyncStatus::Failed` and zero writes.
pub fn run_reconciliation(
    db: &RenewalDb,
    feed: &dyn SourceFeed,
    options: &ReconcileOptions,
) -> SyncOutcome {
    let now = Utc::now().to_rfc3339();
    let mut outcome = SyncOutcome::started(Uuid::new_v4().to_string(), now.clone());
    log::info!(
        "Sync {}: reconciling {} from {} (orphan policy {:?})",
        outcome.run_id,
        WORKING_TABLE,
        feed.name(),
        options.orphan_policy
    );

    match execute(db, feed, options, &now) {
        Ok(tally) => {
            outcome.inserted = tally.inserted;
            outcome.updated = tally.updated;
            outcome.unchanged = tally.unchanged;
            outcome.orphaned = tally.orphaned;
            outcome.failed = tally.failures.len();
            outcome.row_errors = tally.failures;
            outcome.status = if outcome.failed == 0 {
                SyncStatus::Success
            } else {
                SyncStatus::Partial
            };
        }
        Err(e) => {
            log::error!(
                "Sync {}: run against {} failed, no rows written: {}",
                outcome.run_id,
                WORKING_TABLE,
                e
            );
            outcome.status = SyncStatus::Failed;
            outcome.error = Some(e.to_string());
        }
    }
    outcome.finished_at = Utc::now().to_rfc3339();

    match history::record_run(db, &outcome) {
        Ok(id) => outcome.history_id = Some(id),
        Err(e) => log::error!("Sync {}: history entry not recorded: {}", outcome.run_id, e),
    }

    log::info!(
        "Sync {} finished {}: inserted={} updated={} unchanged={} orphaned={} failed={}",
        outcome.run_id,
        outcome.status.as_str(),
        outcome.inserted,
        outcome.updated,
        outcome.unchanged,
        outcome.orphaned,
        outcome.failed
    );
    outcome
}

fn execute(
    db: &RenewalDb,
    feed: &dyn SourceFeed,
    options: &ReconcileOptions,
    now: &str,
) -> Result<RunTally, DbError> {
    let source = feed
        .fetch_all()
        .map_err(|e| DbError::SourceUnavailable(format!("{}: {}", feed.name(), e)))?;

    db.with_transaction(|db| {
        // Read inside the write lock so the plan matches what gets written.
        let working = db.get_all_working_renewals()?;
        let plan = plan_merge(&source, &working, options.orphan_policy);

        let mut tally = RunTally {
            unchanged: plan.unchanged,
            orphaned: plan.orphaned,
            failures: plan.rejected,
            ..RunTally::default()
        };
        for failure in &tally.failures {
            log::warn!(
                "Sync: skipped {} row '{}': {}",
                feed.name(),
                failure.policy_id,
                failure.message
            );
        }

        for action in &plan.actions {
            match apply_with_retry(db, action, options.row_retry_limit, now) {
                Ok(()) => match action {
                    RowAction::Insert { .. } => tally.inserted += 1,
                    RowAction::Refresh { .. } => tally.updated += 1,
                    RowAction::FlagOrphan { .. } => {}
                },
                Err(failure) => tally.failures.push(failure),
            }
        }
        Ok(tally)
    })
}

/// Apply one action in its own savepoint, retrying up to `retry_limit` extra
/// times. A failed attempt leaves no partial write behind.
fn apply_with_retry(
    db: &RenewalDb,
    action: &RowAction,
    retry_limit: u32,
    now: &str,
) -> Result<(), RowFailure> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match db.with_savepoint(ROW_SAVEPOINT, |db| apply_action(db, action, now)) {
            Ok(()) => return Ok(()),
            Err(e) if attempts <= retry_limit => {
                log::warn!(
                    "Sync: {} of {} row '{}' failed (attempt {}), retrying: {}",
                    action.operation(),
                    WORKING_TABLE,
                    action.policy_id(),
                    attempts,
                    e
                );
            }
            Err(e) => {
                log::error!(
                    "Sync: {} of {} row '{}' failed after {} attempts: {}",
                    action.operation(),
                    WORKING_TABLE,
                    action.policy_id(),
                    attempts,
                    e
                );
                return Err(RowFailure {
                    policy_id: action.policy_id().to_string(),
                    operation: action.operation().to_string(),
                    message: e.to_string(),
                    attempts,
                });
            }
        }
    }
}

fn apply_action(db: &RenewalDb, action: &RowAction, now: &str) -> Result<(), DbError> {
    let found = match action {
        RowAction::Insert { policy_id, fields } => {
            db.insert_working_from_source(policy_id, fields, now)?;
            true
        }
        RowAction::Refresh { policy_id, fields } => {
            db.refresh_source_fields(policy_id, fields, now)?
        }
        RowAction::FlagOrphan { policy_id } => db.set_source_missing_since(policy_id, Some(now))?,
    };
    if found {
        Ok(())
    } else {
        Err(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }
}
