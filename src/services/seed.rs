// Seed service
// Sample data for demos and local testing. Exposed over HTTP only when
// `enableSeed` is set.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::db::{
    NewQuote, OverlayFields, RenewalDb, RenewalStatus, SourceFields, SourceRenewal, WorkingRenewal,
};
use crate::error::ServiceError;

/// Recorded as `marked_for_deletion_by` on rows seeded already marked.
const SEED_ACTOR: &str = "seed";

#[derive(Debug, Clone, Default)]
pub struct SeedBatch {
    pub renewals: Vec<WorkingRenewal>,
    /// Replace the quotes of every seeded policy.
    pub quotes: Vec<NewQuote>,
    /// Optional matching `zone_original` rows.
    pub source: Vec<SourceRenewal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub renewals: usize,
    pub quotes: usize,
    pub source_rows: usize,
}

/// Upsert a batch in one transaction. Re-seeding the same batch leaves the
/// store as it was after the first seed.
pub fn seed(db: &RenewalDb, batch: &SeedBatch, now: &str) -> Result<SeedSummary, ServiceError> {
    let summary = db
        .with_transaction(|db| {
            for source in &batch.source {
                db.upsert_source_renewal(source)?;
            }
            for renewal in &batch.renewals {
                db.upsert_working_renewal(renewal)?;
            }

            let policies: BTreeSet<&str> = batch
                .renewals
                .iter()
                .map(|r| r.policy_id.as_str())
                .chain(batch.quotes.iter().map(|q| q.policy_id.as_str()))
                .collect();
            for policy_id in policies {
                db.delete_quotes_for_policy(policy_id)?;
            }
            for quote in &batch.quotes {
                db.insert_quote(quote, now)?;
            }

            Ok(SeedSummary {
                renewals: batch.renewals.len(),
                quotes: batch.quotes.len(),
                source_rows: batch.source.len(),
            })
        })
        .map_err(|e| ServiceError::store("seed", e))?;

    log::info!(
        "Seeded {} renewals, {} quotes, {} source rows",
        summary.renewals,
        summary.quotes,
        summary.source_rows
    );
    Ok(summary)
}

struct Sample {
    policy_id: &'static str,
    client_name: &'static str,
    account_manager: &'static str,
    expiry_date: &'static str,
    invoice_total: f64,
    revenue: f64,
    zone: &'static str,
    lob: &'static str,
    renewal_colour: &'static str,
    renewal_order: i64,
    settled: bool,
    marked_for_deletion: bool,
}

const SAMPLES: &[Sample] = &[
    Sample {
        policy_id: "POL-2025-001",
        client_name: "ABC Manufacturing Ltd",
        account_manager: "John Smith",
        expiry_date: "2025-03-15",
        invoice_total: 25000.0,
        revenue: 3750.0,
        zone: "North",
        lob: "Property",
        renewal_colour: "Green",
        renewal_order: 1,
        settled: false,
        marked_for_deletion: false,
    },
    Sample {
        policy_id: "POL-2025-002",
        client_name: "XYZ Services Inc",
        account_manager: "Jane Doe",
        expiry_date: "2025-04-20",
        invoice_total: 18500.0,
        revenue: 2775.0,
        zone: "South",
        lob: "Liability",
        renewal_colour: "Amber",
        renewal_order: 2,
        settled: false,
        marked_for_deletion: false,
    },
    Sample {
        policy_id: "POL-2025-003",
        client_name: "Tech Innovators LLC",
        account_manager: "Bob Johnson",
        expiry_date: "2025-02-28",
        invoice_total: 42000.0,
        revenue: 6300.0,
        zone: "East",
        lob: "Professional Indemnity",
        renewal_colour: "Red",
        renewal_order: 1,
        settled: false,
        marked_for_deletion: false,
    },
    Sample {
        policy_id: "POL-2025-004",
        client_name: "Global Traders Co",
        account_manager: "Sarah Williams",
        expiry_date: "2025-05-10",
        invoice_total: 31000.0,
        revenue: 4650.0,
        zone: "West",
        lob: "Marine",
        renewal_colour: "Green",
        renewal_order: 3,
        settled: true,
        marked_for_deletion: true,
    },
    Sample {
        policy_id: "POL-2025-005",
        client_name: "Retail Solutions Ltd",
        account_manager: "John Smith",
        expiry_date: "2025-03-25",
        invoice_total: 15000.0,
        revenue: 2250.0,
        zone: "North",
        lob: "Property",
        renewal_colour: "Amber",
        renewal_order: 2,
        settled: false,
        marked_for_deletion: false,
    },
];

/// (policy, class, insurer, premium, broker fee, comments)
const SAMPLE_QUOTES: &[(&str, &str, &str, f64, f64, &str)] = &[
    ("POL-2025-001", "Property - Buildings", "AXA", 22000.0, 2200.0, "Best rate - recommended"),
    ("POL-2025-001", "Property - Buildings", "Allianz", 24500.0, 2450.0, "Higher premium but better coverage"),
    ("POL-2025-002", "General Liability", "Zurich", 16000.0, 1600.0, "Standard terms"),
    ("POL-2025-003", "Professional Indemnity", "Hiscox", 38000.0, 3800.0, "Incumbent - renewal"),
    ("POL-2025-003", "Professional Indemnity", "CNA", 35000.0, 3500.0, "Better price - consider switch"),
    ("POL-2025-003", "Professional Indemnity", "Beazley", 39500.0, 3950.0, "Higher coverage limits"),
];

/// Five sample renewals across four account managers, six quotes, and
/// source rows that reconcile to the seeded source fields unchanged.
pub fn sample_batch(now: &str) -> SeedBatch {
    let source: Vec<SourceRenewal> = SAMPLES
        .iter()
        .map(|s| SourceRenewal {
            policy_id: s.policy_id.to_string(),
            client_code: None,
            client_name: Some(s.client_name.to_string()),
            lob: Some(s.lob.to_string()),
            expiry_date: Some(s.expiry_date.to_string()),
            invoice_total: Some(s.invoice_total),
            status: s.settled,
            comments: None,
        })
        .collect();

    let renewals = SAMPLES
        .iter()
        .zip(&source)
        .map(|(s, row)| WorkingRenewal {
            policy_id: s.policy_id.to_string(),
            source: SourceFields::from_source(row),
            overlay: OverlayFields {
                marked_for_deletion: s.marked_for_deletion,
                marked_for_deletion_at: s.marked_for_deletion.then(|| now.to_string()),
                marked_for_deletion_by: s.marked_for_deletion.then(|| SEED_ACTOR.to_string()),
                account_manager: Some(s.account_manager.to_string()),
                zone: Some(s.zone.to_string()),
                renewal_colour: Some(s.renewal_colour.to_string()),
                renewal_order: Some(s.renewal_order),
                transaction_type: Some("Renewal".to_string()),
                revenue: Some(s.revenue),
                policy_number: Some(s.policy_id.to_string()),
                ..OverlayFields::default()
            },
            source_missing_since: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        })
        .collect();

    let quotes = SAMPLE_QUOTES
        .iter()
        .map(|(policy_id, class, insurer, premium, broker_fee, comments)| NewQuote {
            policy_id: policy_id.to_string(),
            class: Some(class.to_string()),
            insurer: Some(insurer.to_string()),
            premium: Some(*premium),
            broker_fee: Some(*broker_fee),
            comments: Some(comments.to_string()),
        })
        .collect();

    SeedBatch {
        renewals,
        quotes,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::workflow::reconcile::{reconcile, ReconcileOptions};

    const T0: &str = "2025-01-01T00:00:00+00:00";

    #[test]
    fn test_sample_batch_shape() {
        let batch = sample_batch(T0);
        assert_eq!(batch.renewals.len(), 5);
        assert_eq!(batch.quotes.len(), 6);
        assert_eq!(batch.source.len(), 5);

        let marked: Vec<_> = batch
            .renewals
            .iter()
            .filter(|r| r.overlay.marked_for_deletion)
            .collect();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].policy_id, "POL-2025-004");
        assert_eq!(marked[0].overlay.marked_for_deletion_at.as_deref(), Some(T0));
        assert_eq!(marked[0].source.status, RenewalStatus::Completed);
    }

    #[test]
    fn test_reseed_is_idempotent() {
        let db = test_db();
        let batch = sample_batch(T0);
        let first = seed(&db, &batch, T0).unwrap();
        let snapshot = db.get_all_working_renewals().unwrap();

        let second = seed(&db, &batch, T0).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.get_all_working_renewals().unwrap(), snapshot);

        let quotes = db.get_quotes_for_policy("POL-2025-003").unwrap();
        assert_eq!(quotes.len(), 3, "quotes are replaced, not duplicated");
    }

    #[test]
    fn test_seeded_rows_reconcile_unchanged() {
        let db = test_db();
        seed(&db, &sample_batch(T0), T0).unwrap();

        let outcome = reconcile(&db, &ReconcileOptions::default());
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.unchanged, 5);

        let row = db.get_working_renewal("POL-2025-004").unwrap().unwrap();
        assert_eq!(row.source.status, RenewalStatus::Completed);
        assert!(row.overlay.marked_for_deletion);
    }
}
