//! Shared type definitions for the database layer.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Source feed unavailable: {0}")]
    SourceUnavailable(String),

    #[error("In-memory database cannot be reopened")]
    InMemory,

    #[error("Source-owned column {0} has no field mapping")]
    UnmappedColumn(&'static str),

    /// A store failure reported earlier and carried as text, e.g. by a
    /// finished sync outcome.
    #[error("{0}")]
    Reported(String),

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Field ownership
// =============================================================================

/// Who is allowed to write a `zone_working` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOwner {
    /// The merge key. Written once on insert.
    Key,
    /// Refreshed from `zone_original` by every reconciliation run.
    Source,
    /// CRM-only. Never written by reconciliation.
    Overlay,
    /// Bookkeeping maintained by this crate (timestamps, orphan marker).
    System,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub column: &'static str,
    pub owner: FieldOwner,
}

const fn field(column: &'static str, owner: FieldOwner) -> FieldSpec {
    FieldSpec { column, owner }
}

/// Ownership of every `zone_working` column. A column missing from this
/// table fails `test_every_working_column_declares_owner`.
pub const WORKING_COLUMNS: &[FieldSpec] = &[
    field("policy_id", FieldOwner::Key),
    field("client_code", FieldOwner::Source),
    field("client_name", FieldOwner::Source),
    field("lob", FieldOwner::Source),
    field("expiry_date", FieldOwner::Source),
    field("invoice_total", FieldOwner::Source),
    field("status", FieldOwner::Source),
    field("comments", FieldOwner::Source),
    field("marked_for_deletion", FieldOwner::Overlay),
    field("marked_for_deletion_at", FieldOwner::Overlay),
    field("marked_for_deletion_by", FieldOwner::Overlay),
    field("notes", FieldOwner::Overlay),
    field("account_manager", FieldOwner::Overlay),
    field("account_manager_id", FieldOwner::Overlay),
    field("client_id", FieldOwner::Overlay),
    field("client_group", FieldOwner::Overlay),
    field("client_group_id", FieldOwner::Overlay),
    field("zone", FieldOwner::Overlay),
    field("ledger", FieldOwner::Overlay),
    field("underwriter_name", FieldOwner::Overlay),
    field("underwriter_id", FieldOwner::Overlay),
    field("renewal_colour", FieldOwner::Overlay),
    field("renewal_order", FieldOwner::Overlay),
    field("transaction_type", FieldOwner::Overlay),
    field("revenue", FieldOwner::Overlay),
    field("policy_number", FieldOwner::Overlay),
    field("inception_date", FieldOwner::Overlay),
    field("source_missing_since", FieldOwner::System),
    field("created_at", FieldOwner::System),
    field("updated_at", FieldOwner::System),
];

/// Columns of one ownership group, in declaration order.
pub fn columns_owned_by(owner: FieldOwner) -> impl Iterator<Item = &'static str> {
    WORKING_COLUMNS
        .iter()
        .filter(move |f| f.owner == owner)
        .map(|f| f.column)
}

pub fn owner_of(column: &str) -> Option<FieldOwner> {
    WORKING_COLUMNS
        .iter()
        .find(|f| f.column == column)
        .map(|f| f.owner)
}

// =============================================================================
// Workflow status
// =============================================================================

/// Workflow status of a working renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl RenewalStatus {
    /// Settled source rows are complete; everything else still needs work.
    pub fn from_settled(settled: bool) -> Self {
        if settled {
            RenewalStatus::Completed
        } else {
            RenewalStatus::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalStatus::Pending => "pending",
            RenewalStatus::InProgress => "in_progress",
            RenewalStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RenewalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenewalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RenewalStatus::Pending),
            "in_progress" => Ok(RenewalStatus::InProgress),
            "completed" => Ok(RenewalStatus::Completed),
            other => Err(format!("Unknown renewal status: {other}")),
        }
    }
}

impl ToSql for RenewalStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RenewalStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

// =============================================================================
// Renewals
// =============================================================================

/// A row from `zone_original`, the externally maintained source ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRenewal {
    pub policy_id: String,
    pub client_code: Option<String>,
    pub client_name: Option<String>,
    pub lob: Option<String>,
    pub expiry_date: Option<String>,
    pub invoice_total: Option<f64>,
    /// Settled in the source ledger.
    pub status: bool,
    pub comments: Option<String>,
}

/// The field group reconciliation owns on a working renewal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceFields {
    pub client_code: Option<String>,
    pub client_name: Option<String>,
    pub lob: Option<String>,
    pub expiry_date: Option<String>,
    pub invoice_total: Option<f64>,
    pub status: RenewalStatus,
    /// Comments carried over from the source ledger. Not the CRM `notes`.
    pub comments: Option<String>,
}

impl SourceFields {
    pub fn from_source(source: &SourceRenewal) -> Self {
        Self {
            client_code: source.client_code.clone(),
            client_name: source.client_name.clone(),
            lob: source.lob.clone(),
            expiry_date: source.expiry_date.clone(),
            invoice_total: source.invoice_total,
            status: RenewalStatus::from_settled(source.status),
            comments: source.comments.clone(),
        }
    }

    /// Value bound for a source-owned `zone_working` column.
    pub fn column_value(&self, column: &str) -> Option<&dyn ToSql> {
        let value: &dyn ToSql = match column {
            "client_code" => &self.client_code,
            "client_name" => &self.client_name,
            "lob" => &self.lob,
            "expiry_date" => &self.expiry_date,
            "invoice_total" => &self.invoice_total,
            "status" => &self.status,
            "comments" => &self.comments,
            _ => return None,
        };
        Some(value)
    }
}

/// CRM-only fields. Reconciliation never writes any of these.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OverlayFields {
    pub marked_for_deletion: bool,
    pub marked_for_deletion_at: Option<String>,
    pub marked_for_deletion_by: Option<String>,
    pub notes: Option<String>,
    pub account_manager: Option<String>,
    pub account_manager_id: Option<String>,
    pub client_id: Option<String>,
    pub client_group: Option<String>,
    pub client_group_id: Option<String>,
    pub zone: Option<String>,
    pub ledger: Option<String>,
    pub underwriter_name: Option<String>,
    pub underwriter_id: Option<String>,
    pub renewal_colour: Option<String>,
    pub renewal_order: Option<i64>,
    pub transaction_type: Option<String>,
    pub revenue: Option<f64>,
    pub policy_number: Option<String>,
    pub inception_date: Option<String>,
}

impl OverlayFields {
    /// Null out one overlay field by column name. Returns false for columns
    /// that are not nullable overlay fields.
    pub fn clear_field(&mut self, column: &str) -> bool {
        match column {
            "marked_for_deletion_at" => self.marked_for_deletion_at = None,
            "marked_for_deletion_by" => self.marked_for_deletion_by = None,
            "notes" => self.notes = None,
            "account_manager" => self.account_manager = None,
            "account_manager_id" => self.account_manager_id = None,
            "client_id" => self.client_id = None,
            "client_group" => self.client_group = None,
            "client_group_id" => self.client_group_id = None,
            "zone" => self.zone = None,
            "ledger" => self.ledger = None,
            "underwriter_name" => self.underwriter_name = None,
            "underwriter_id" => self.underwriter_id = None,
            "renewal_colour" => self.renewal_colour = None,
            "renewal_order" => self.renewal_order = None,
            "transaction_type" => self.transaction_type = None,
            "revenue" => self.revenue = None,
            "policy_number" => self.policy_number = None,
            "inception_date" => self.inception_date = None,
            _ => return false,
        }
        true
    }
}

/// A row from `zone_working`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingRenewal {
    pub policy_id: String,
    #[serde(flatten)]
    pub source: SourceFields,
    #[serde(flatten)]
    pub overlay: OverlayFields,
    /// Set while the source ledger no longer carries this policy
    /// (only under `OrphanPolicy::Flag`).
    pub source_missing_since: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// =============================================================================
// Quotes
// =============================================================================

/// A row from `quotes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbQuote {
    pub id: i64,
    pub policy_id: String,
    pub class: Option<String>,
    pub insurer: Option<String>,
    pub premium: Option<f64>,
    pub broker_fee: Option<f64>,
    pub comments: Option<String>,
    pub created_at: String,
}

/// Quote payload before it has a row id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQuote {
    pub policy_id: String,
    pub class: Option<String>,
    pub insurer: Option<String>,
    pub premium: Option<f64>,
    pub broker_fee: Option<f64>,
    pub comments: Option<String>,
}

// =============================================================================
// Sync history
// =============================================================================

/// How a reconciliation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }
}

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "success" => Ok(SyncStatus::Success),
            "partial" => Ok(SyncStatus::Partial),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(FromSqlError::Other(
                format!("Unknown sync status: {other}").into(),
            )),
        }
    }
}

/// A row from `sync_history`. Rows are never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub id: i64,
    pub run_id: String,
    pub table_name: String,
    pub status: SyncStatus,
    pub started_at: String,
    pub finished_at: String,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
    pub rows_unchanged: i64,
    pub rows_orphaned: i64,
    pub rows_failed: i64,
    /// Structured error payload for partial or failed runs.
    pub error_details: Option<serde_json::Value>,
    pub created_at: String,
}

/// Insert payload for `sync_history`.
#[derive(Debug, Clone)]
pub struct NewSyncHistory<'a> {
    pub run_id: &'a str,
    pub table_name: &'a str,
    pub status: SyncStatus,
    pub started_at: &'a str,
    pub finished_at: &'a str,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
    pub rows_unchanged: i64,
    pub rows_orphaned: i64,
    pub rows_failed: i64,
    pub error_details: Option<&'a serde_json::Value>,
}
