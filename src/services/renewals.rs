// Renewals service
// Account-manager scoped listing, overlay edits, and dashboard stats.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::db::{DbQuote, OverlayFields, OverlayUpdate, RenewalDb, WorkingRenewal};
use crate::error::ServiceError;
use crate::types::Actor;

/// Days ahead counted as an upcoming expiry.
const UPCOMING_EXPIRY_DAYS: i64 = 30;

/// One renewal as presented to an account manager.
#[derive(Debug, Clone, Serialize)]
pub struct RenewalView {
    /// `renewal_order` here is the 1-based position in the returned list.
    #[serde(flatten)]
    pub renewal: WorkingRenewal,
    pub quotes: Vec<DbQuote>,
    /// Fields returned as null because their upstream is not wired yet.
    pub unavailable_fields: Vec<String>,
}

/// Overlay edit requested by a user. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverlayPatch {
    pub marked_for_deletion: Option<bool>,
    /// A blank string clears the notes.
    pub notes: Option<String>,
}

impl OverlayPatch {
    pub fn is_empty(&self) -> bool {
        self.marked_for_deletion.is_none() && self.notes.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenewalStats {
    pub total_renewals: usize,
    pub marked_for_deletion: usize,
    pub total_revenue: f64,
    pub total_quotes: usize,
    pub upcoming_expiries: usize,
}

// =============================================================================
// Queries
// =============================================================================

/// Renewals assigned to `account_manager`, each with its quotes.
pub fn list_renewals(
    db: &RenewalDb,
    account_manager: &str,
    unavailable_fields: &[String],
) -> Result<Vec<RenewalView>, ServiceError> {
    let account_manager = account_manager.trim();
    if account_manager.is_empty() {
        return Err(ServiceError::validation(
            "accountManager query parameter is required",
        ));
    }

    let renewals = db
        .get_working_renewals_for_manager(account_manager)
        .map_err(|e| ServiceError::store("list_renewals", e))?;

    let policy_ids: Vec<String> = renewals.iter().map(|r| r.policy_id.clone()).collect();
    let mut quotes = match db.get_quotes_for_policies(&policy_ids) {
        Ok(quotes) => quotes,
        Err(e) => {
            log::warn!(
                "Quotes for {} renewals of '{}' unavailable, returning without quotes: {}",
                policy_ids.len(),
                account_manager,
                e
            );
            HashMap::new()
        }
    };

    let unavailable = nullable_overlay_fields(unavailable_fields);
    Ok(renewals
        .into_iter()
        .enumerate()
        .map(|(index, mut renewal)| {
            for field in &unavailable {
                renewal.overlay.clear_field(field);
            }
            renewal.overlay.renewal_order = Some(index as i64 + 1);
            RenewalView {
                quotes: quotes.remove(&renewal.policy_id).unwrap_or_default(),
                renewal,
                unavailable_fields: unavailable.clone(),
            }
        })
        .collect())
}

/// Configured unavailable fields that name a nullable overlay column.
/// `renewal_order` is always derived, so it is never reported unavailable.
fn nullable_overlay_fields(configured: &[String]) -> Vec<String> {
    let mut probe = OverlayFields::default();
    configured
        .iter()
        .filter(|field| {
            let known = field.as_str() != "renewal_order" && probe.clear_field(field);
            if !known {
                log::warn!("Ignoring unavailable field '{}': not a nullable overlay column", field);
            }
            known
        })
        .cloned()
        .collect()
}

pub fn list_account_managers(db: &RenewalDb) -> Result<Vec<String>, ServiceError> {
    db.get_account_managers()
        .map_err(|e| ServiceError::store("list_account_managers", e))
}

/// Dashboard counters for one account manager's renewals.
pub fn renewal_stats(
    db: &RenewalDb,
    account_manager: &str,
    unavailable_fields: &[String],
    today: NaiveDate,
) -> Result<RenewalStats, ServiceError> {
    let views = list_renewals(db, account_manager, unavailable_fields)?;
    let horizon = today + Duration::days(UPCOMING_EXPIRY_DAYS);

    let mut stats = RenewalStats {
        total_renewals: views.len(),
        ..RenewalStats::default()
    };
    for view in &views {
        let renewal = &view.renewal;
        if renewal.overlay.marked_for_deletion {
            stats.marked_for_deletion += 1;
        }
        stats.total_revenue += renewal.overlay.revenue.unwrap_or(0.0);
        stats.total_quotes += view.quotes.len();
        if renewal
            .source
            .expiry_date
            .as_deref()
            .and_then(parse_date)
            .is_some_and(|expiry| expiry >= today && expiry <= horizon)
        {
            stats.upcoming_expiries += 1;
        }
    }
    Ok(stats)
}

/// Accepts `YYYY-MM-DD` or any timestamp starting with one.
fn parse_date(value: &str) -> Option<NaiveDate> {
    let date = value.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

// =============================================================================
// Mutations
// =============================================================================

/// Apply an overlay edit on behalf of `actor` and return the updated row.
///
/// Runs as one statement, so a concurrent reconciliation (which only writes
/// source-owned columns) cannot interleave with it.
pub fn update_overlay(
    db: &RenewalDb,
    policy_id: &str,
    patch: &OverlayPatch,
    actor: &Actor,
    now: &str,
) -> Result<WorkingRenewal, ServiceError> {
    let policy_id = policy_id.trim();
    if policy_id.is_empty() {
        return Err(ServiceError::validation("policy_id is required"));
    }
    if actor.user_id.trim().is_empty() {
        return Err(ServiceError::validation("An acting user is required"));
    }
    if patch.is_empty() {
        return Err(ServiceError::validation(
            "Provide marked_for_deletion or notes to update",
        ));
    }

    let update = OverlayUpdate {
        marked_for_deletion: patch.marked_for_deletion,
        notes: patch.notes.as_deref().map(|notes| {
            if notes.trim().is_empty() {
                None
            } else {
                Some(notes)
            }
        }),
    };

    let found = db
        .update_overlay_fields(policy_id, &update, &actor.user_id, now)
        .map_err(|e| ServiceError::store("update_overlay", e))?;
    if !found {
        return Err(ServiceError::NotFound(policy_id.to_string()));
    }
    log::info!(
        "Overlay updated for {} by {} (marked_for_deletion={:?}, notes={})",
        policy_id,
        actor.user_id,
        patch.marked_for_deletion,
        if patch.notes.is_some() { "set" } else { "kept" }
    );

    db.get_working_renewal(policy_id)
        .map_err(|e| ServiceError::store("update_overlay", e))?
        .ok_or_else(|| ServiceError::NotFound(policy_id.to_string()))
}
