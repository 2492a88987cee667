use rusqlite::{params, OptionalExtension, Row, ToSql};

use super::*;

/// Column list shared by every `zone_working` read, matching `map_working_row`.
const WORKING_SELECT: &str = "SELECT policy_id,
        client_code, client_name, lob, expiry_date, invoice_total, status, comments,
        marked_for_deletion, marked_for_deletion_at, marked_for_deletion_by, notes,
        account_manager, account_manager_id, client_id, client_group, client_group_id,
        zone, ledger, underwriter_name, underwriter_id, renewal_colour, renewal_order,
        transaction_type, revenue, policy_number, inception_date,
        source_missing_since, created_at, updated_at
     FROM zone_working";

/// Presentation order: zone, stored rank (unranked last), expiry, then insert order.
const WORKING_ORDER: &str = "ORDER BY zone, renewal_order IS NULL, renewal_order, expiry_date, rowid";

/// Overlay edit applied by `update_overlay_fields`. `None` leaves the column alone.
#[derive(Debug, Clone, Default)]
pub struct OverlayUpdate<'a> {
    pub marked_for_deletion: Option<bool>,
    /// `Some(None)` clears the notes.
    pub notes: Option<Option<&'a str>>,
}

/// The source-owned columns of `WORKING_COLUMNS` paired with their values.
fn source_columns(
    fields: &SourceFields,
) -> Result<(Vec<&'static str>, Vec<&dyn ToSql>), DbError> {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for column in columns_owned_by(FieldOwner::Source) {
        let value = fields
            .column_value(column)
            .ok_or(DbError::UnmappedColumn(column))?;
        columns.push(column);
        values.push(value);
    }
    Ok((columns, values))
}

impl RenewalDb {
    // =========================================================================
    // Source ledger (zone_original)
    // =========================================================================

    /// Insert or replace a source ledger row. Used by the upstream loader and seeding.
    pub fn upsert_source_renewal(&self, source: &SourceRenewal) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO zone_original (
                policy_id, client_code, client_name, lob, expiry_date,
                invoice_total, status, comments
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(policy_id) DO UPDATE SET
                client_code = excluded.client_code,
                client_name = excluded.client_name,
                lob = excluded.lob,
                expiry_date = excluded.expiry_date,
                invoice_total = excluded.invoice_total,
                status = excluded.status,
                comments = excluded.comments",
            params![
                source.policy_id,
                source.client_code,
                source.client_name,
                source.lob,
                source.expiry_date,
                source.invoice_total,
                source.status,
                source.comments,
            ],
        )?;
        Ok(())
    }

    pub fn delete_source_renewal(&self, policy_id: &str) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "DELETE FROM zone_original WHERE policy_id = ?1",
            params![policy_id],
        )?;
        Ok(rows > 0)
    }

    /// Every source row, in fetch (insert) order.
    pub fn get_all_source_renewals(&self) -> Result<Vec<SourceRenewal>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT policy_id, client_code, client_name, lob, expiry_date,
                    invoice_total, status, comments
             FROM zone_original ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceRenewal {
                policy_id: row.get(0)?,
                client_code: row.get(1)?,
                client_name: row.get(2)?,
                lob: row.get(3)?,
                expiry_date: row.get(4)?,
                invoice_total: row.get(5)?,
                status: row.get(6)?,
                comments: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Working table (zone_working): reads
    // =========================================================================

    pub fn get_working_renewal(&self, policy_id: &str) -> Result<Option<WorkingRenewal>, DbError> {
        let sql = format!("{WORKING_SELECT} WHERE policy_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![policy_id], Self::map_working_row)
            .optional()?)
    }

    /// Every working row, in insert order.
    pub fn get_all_working_renewals(&self) -> Result<Vec<WorkingRenewal>, DbError> {
        let sql = format!("{WORKING_SELECT} ORDER BY rowid");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_working_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Working rows assigned to one account manager, in presentation order.
    pub fn get_working_renewals_for_manager(
        &self,
        account_manager: &str,
    ) -> Result<Vec<WorkingRenewal>, DbError> {
        let sql = format!("{WORKING_SELECT} WHERE account_manager = ?1 {WORKING_ORDER}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_manager], Self::map_working_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct non-blank account managers that own at least one renewal.
    pub fn get_account_managers(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT account_manager FROM zone_working
             WHERE account_manager IS NOT NULL AND trim(account_manager) != ''
             ORDER BY account_manager",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Working table: reconciliation writes (source-owned group only)
    // =========================================================================

    /// Insert a working row for a new source row. Overlay columns take their
    /// schema defaults.
    pub fn insert_working_from_source(
        &self,
        policy_id: &str,
        fields: &SourceFields,
        now: &str,
    ) -> Result<(), DbError> {
        let (columns, values) = source_columns(fields)?;
        let placeholders: Vec<String> = (0..columns.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "INSERT INTO zone_working (policy_id, {}, created_at, updated_at)
             VALUES (?1, {}, ?2, ?2)",
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut bound: Vec<&dyn ToSql> = vec![&policy_id, &now];
        bound.extend(values);
        self.conn.execute(&sql, bound.as_slice())?;
        Ok(())
    }

    /// Overwrite the source-owned group of an existing working row and clear
    /// any orphan marker. Returns false when the row does not exist.
    pub fn refresh_source_fields(
        &self,
        policy_id: &str,
        fields: &SourceFields,
        now: &str,
    ) -> Result<bool, DbError> {
        let (columns, values) = source_columns(fields)?;
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 3))
            .collect();
        let sql = format!(
            "UPDATE zone_working SET {}, source_missing_since = NULL, updated_at = ?2
             WHERE policy_id = ?1",
            assignments.join(", ")
        );

        let mut bound: Vec<&dyn ToSql> = vec![&policy_id, &now];
        bound.extend(values);
        let rows = self.conn.execute(&sql, bound.as_slice())?;
        Ok(rows > 0)
    }

    /// Set or clear the orphan marker. Leaves `updated_at` alone: the row's
    /// content did not change.
    pub fn set_source_missing_since(
        &self,
        policy_id: &str,
        since: Option<&str>,
    ) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "UPDATE zone_working SET source_missing_since = ?2 WHERE policy_id = ?1",
            params![policy_id, since],
        )?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Working table: overlay writes
    // =========================================================================

    /// Apply a partial overlay edit in a single statement. Columns not named
    /// in `update` keep whatever value is stored at write time.
    ///
    /// The deletion stamp only moves when the flag actually changes; SQLite
    /// evaluates every SET expression against the pre-update row.
    /// Returns false when no row matches.
    pub fn update_overlay_fields(
        &self,
        policy_id: &str,
        update: &OverlayUpdate<'_>,
        actor: &str,
        now: &str,
    ) -> Result<bool, DbError> {
        let (notes_present, notes_value) = match update.notes {
            Some(value) => (true, value),
            None => (false, None),
        };
        let rows = self.conn.execute(
            "UPDATE zone_working SET
                marked_for_deletion_at = CASE
                    WHEN ?2 IS NOT NULL AND ?2 != marked_for_deletion
                    THEN CASE WHEN ?2 = 1 THEN ?5 ELSE NULL END
                    ELSE marked_for_deletion_at
                END,
                marked_for_deletion_by = CASE
                    WHEN ?2 IS NOT NULL AND ?2 != marked_for_deletion
                    THEN CASE WHEN ?2 = 1 THEN ?6 ELSE NULL END
                    ELSE marked_for_deletion_by
                END,
                marked_for_deletion = COALESCE(?2, marked_for_deletion),
                notes = CASE WHEN ?3 THEN ?4 ELSE notes END,
                updated_at = ?5
             WHERE policy_id = ?1",
            params![
                policy_id,
                update.marked_for_deletion,
                notes_present,
                notes_value,
                now,
                actor,
            ],
        )?;
        Ok(rows > 0)
    }

    /// Full upsert of a working row. Only the seed/bootstrap path uses this;
    /// reconciliation and mutation go through the group-specific writers.
    pub fn upsert_working_renewal(&self, renewal: &WorkingRenewal) -> Result<(), DbError> {
        let s = &renewal.source;
        let o = &renewal.overlay;
        self.conn.execute(
            "INSERT INTO zone_working (
                policy_id, client_code, client_name, lob, expiry_date, invoice_total,
                status, comments, marked_for_deletion, marked_for_deletion_at,
                marked_for_deletion_by, notes, account_manager, account_manager_id,
                client_id, client_group, client_group_id, zone, ledger, underwriter_name,
                underwriter_id, renewal_colour, renewal_order, transaction_type, revenue,
                policy_number, inception_date, source_missing_since, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                       ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                       ?29, ?30)
             ON CONFLICT(policy_id) DO UPDATE SET
                client_code = excluded.client_code,
                client_name = excluded.client_name,
                lob = excluded.lob,
                expiry_date = excluded.expiry_date,
                invoice_total = excluded.invoice_total,
                status = excluded.status,
                comments = excluded.comments,
                marked_for_deletion = excluded.marked_for_deletion,
                marked_for_deletion_at = excluded.marked_for_deletion_at,
                marked_for_deletion_by = excluded.marked_for_deletion_by,
                notes = excluded.notes,
                account_manager = excluded.account_manager,
                account_manager_id = excluded.account_manager_id,
                client_id = excluded.client_id,
                client_group = excluded.client_group,
                client_group_id = excluded.client_group_id,
                zone = excluded.zone,
                ledger = excluded.ledger,
                underwriter_name = excluded.underwriter_name,
                underwriter_id = excluded.underwriter_id,
                renewal_colour = excluded.renewal_colour,
                renewal_order = excluded.renewal_order,
                transaction_type = excluded.transaction_type,
                revenue = excluded.revenue,
                policy_number = excluded.policy_number,
                inception_date = excluded.inception_date,
                source_missing_since = excluded.source_missing_since,
                updated_at = excluded.updated_at",
            params![
                renewal.policy_id,
                s.client_code,
                s.client_name,
                s.lob,
                s.expiry_date,
                s.invoice_total,
                s.status,
                s.comments,
                o.marked_for_deletion,
                o.marked_for_deletion_at,
                o.marked_for_deletion_by,
                o.notes,
                o.account_manager,
                o.account_manager_id,
                o.client_id,
                o.client_group,
                o.client_group_id,
                o.zone,
                o.ledger,
                o.underwriter_name,
                o.underwriter_id,
                o.renewal_colour,
                o.renewal_order,
                o.transaction_type,
                o.revenue,
                o.policy_number,
                o.inception_date,
                renewal.source_missing_since,
                renewal.created_at,
                renewal.updated_at,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn map_working_row(row: &Row<'_>) -> rusqlite::Result<WorkingRenewal> {
        Ok(WorkingRenewal {
            policy_id: row.get(0)?,
            source: SourceFields {
                client_code: row.get(1)?,
                client_name: row.get(2)?,
                lob: row.get(3)?,
                expiry_date: row.get(4)?,
                invoice_total: row.get(5)?,
                status: row.get(6)?,
                comments: row.get(7)?,
            },
            overlay: OverlayFields {
                marked_for_deletion: row.get(8)?,
                marked_for_deletion_at: row.get(9)?,
                marked_for_deletion_by: row.get(10)?,
                notes: row.get(11)?,
                account_manager: row.get(12)?,
                account_manager_id: row.get(13)?,
                client_id: row.get(14)?,
                client_group: row.get(15)?,
                client_group_id: row.get(16)?,
                zone: row.get(17)?,
                ledger: row.get(18)?,
                underwriter_name: row.get(19)?,
                underwriter_id: row.get(20)?,
                renewal_colour: row.get(21)?,
                renewal_order: row.get(22)?,
                transaction_type: row.get(23)?,
                revenue: row.get(24)?,
                policy_number: row.get(25)?,
                inception_date: row.get(26)?,
            },
            source_missing_since: row.get(27)?,
            created_at: row.get(28)?,
            updated_at: row.get(29)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{source_row, test_db, working_row};
    use super::*;

    const T0: &str = "2025-01-01T00:00:00+00:00";
    const T1: &str = "2025-01-02T00:00:00+00:00";

    #[test]
    fn test_source_rows_keep_fetch_order() {
        let db = test_db();
        for id in ["POL-3", "POL-1", "POL-2"] {
            db.upsert_source_renewal(&source_row(id, "Acme", 100.0))
                .expect("upsert source");
        }
        let ids: Vec<String> = db
            .get_all_source_renewals()
            .unwrap()
            .into_iter()
            .map(|s| s.policy_id)
            .collect();
        assert_eq!(ids, vec!["POL-3", "POL-1", "POL-2"]);
    }

    #[test]
    fn test_insert_from_source_uses_overlay_defaults() {
        let db = test_db();
        let source = source_row("POL-9", "Acme", 500.0);
        db.insert_working_from_source("POL-9", &SourceFields::from_source(&source), T0)
            .unwrap();

        let row = db.get_working_renewal("POL-9").unwrap().expect("row exists");
        assert_eq!(row.overlay, OverlayFields::default());
        assert_eq!(row.source.client_name.as_deref(), Some("Acme"));
        assert_eq!(row.source.status, RenewalStatus::Pending);
        assert_eq!(row.created_at, T0);
    }

    #[test]
    fn test_refresh_source_fields_leaves_overlay() {
        let db = test_db();
        working_row(&db, "POL-1", "Jane Doe", T0);
        db.update_overlay_fields(
            "POL-1",
            &OverlayUpdate {
                marked_for_deletion: Some(true),
                notes: Some(Some("VIP client")),
            },
            "jane",
            T0,
        )
        .unwrap();

        let fields = SourceFields {
            client_name: Some("Renamed".to_string()),
            invoice_total: Some(2000.0),
            status: RenewalStatus::Completed,
            ..SourceFields::default()
        };
        assert!(db.refresh_source_fields("POL-1", &fields, T1).unwrap());

        let row = db.get_working_renewal("POL-1").unwrap().unwrap();
        assert_eq!(row.source, fields);
        assert!(row.overlay.marked_for_deletion);
        assert_eq!(row.overlay.notes.as_deref(), Some("VIP client"));
        assert_eq!(row.overlay.account_manager.as_deref(), Some("Jane Doe"));
        assert_eq!(row.updated_at, T1);
    }

    #[test]
    fn test_every_source_column_maps_to_a_field() {
        let fields = SourceFields::default();
        let (columns, values) = source_columns(&fields).unwrap();
        assert_eq!(columns.len(), values.len());
        assert_eq!(
            columns,
            vec![
                "client_code",
                "client_name",
                "lob",
                "expiry_date",
                "invoice_total",
                "status",
                "comments"
            ]
        );
    }

    #[test]
    fn test_update_overlay_stamps_only_on_flag_change() {
        let db = test_db();
        working_row(&db, "POL-1", "Jane Doe", T0);

        let mark = OverlayUpdate {
            marked_for_deletion: Some(true),
            notes: None,
        };
        db.update_overlay_fields("POL-1", &mark, "jane", T0).unwrap();
        // Re-marking an already marked row keeps the original stamp.
        db.update_overlay_fields("POL-1", &mark, "bob", T1).unwrap();

        let row = db.get_working_renewal("POL-1").unwrap().unwrap();
        assert!(row.overlay.marked_for_deletion);
        assert_eq!(row.overlay.marked_for_deletion_at.as_deref(), Some(T0));
        assert_eq!(row.overlay.marked_for_deletion_by.as_deref(), Some("jane"));
        assert_eq!(row.updated_at, T1);

        let unmark = OverlayUpdate {
            marked_for_deletion: Some(false),
            notes: None,
        };
        db.update_overlay_fields("POL-1", &unmark, "bob", T1).unwrap();
        let row = db.get_working_renewal("POL-1").unwrap().unwrap();
        assert!(!row.overlay.marked_for_deletion);
        assert!(row.overlay.marked_for_deletion_at.is_none());
        assert!(row.overlay.marked_for_deletion_by.is_none());
    }

    #[test]
    fn test_update_overlay_missing_row() {
        let db = test_db();
        let found = db
            .update_overlay_fields(
                "POL-404",
                &OverlayUpdate {
                    marked_for_deletion: None,
                    notes: Some(Some("hello")),
                },
                "jane",
                T0,
            )
            .unwrap();
        assert!(!found);
    }

    #[test]
    fn test_account_managers_are_distinct_and_non_blank() {
        let db = test_db();
        working_row(&db, "POL-1", "John Smith", T0);
        working_row(&db, "POL-2", "Jane Doe", T0);
        working_row(&db, "POL-3", "John Smith", T0);
        working_row(&db, "POL-4", "  ", T0);

        let managers = db.get_account_managers().unwrap();
        assert_eq!(managers, vec!["Jane Doe", "John Smith"]);
    }

    #[test]
    fn test_manager_listing_orders_by_rank_then_insert_order() {
        let db = test_db();
        let mut a = working_row(&db, "POL-A", "Jane Doe", T0);
        working_row(&db, "POL-B", "Jane Doe", T0);
        let mut c = working_row(&db, "POL-C", "Jane Doe", T0);
        a.overlay.renewal_order = Some(2);
        c.overlay.renewal_order = Some(1);
        db.upsert_working_renewal(&a).unwrap();
        db.upsert_working_renewal(&c).unwrap();

        let ids: Vec<String> = db
            .get_working_renewals_for_manager("Jane Doe")
            .unwrap()
            .into_iter()
            .map(|r| r.policy_id)
            .collect();
        assert_eq!(ids, vec!["POL-C", "POL-A", "POL-B"]);
    }

    #[test]
    fn test_renewal_order_unique_per_manager_and_zone() {
        let db = test_db();
        let mut a = working_row(&db, "POL-A", "Jane Doe", T0);
        let mut b = working_row(&db, "POL-B", "Jane Doe", T0);
        a.overlay.zone = Some("North".to_string());
        a.overlay.renewal_order = Some(1);
        b.overlay.zone = Some("North".to_string());
        b.overlay.renewal_order = Some(1);
        db.upsert_working_renewal(&a).unwrap();
        assert!(db.upsert_working_renewal(&b).is_err());

        b.overlay.zone = Some("South".to_string());
        db.upsert_working_renewal(&b)
            .expect("same rank in another zone is allowed");

        let mut c = working_row(&db, "POL-C", "Jane Doe", T0);
        let mut d = working_row(&db, "POL-D", "Jane Doe", T0);
        c.overlay.renewal_order = Some(1);
        d.overlay.renewal_order = Some(1);
        db.upsert_working_renewal(&c).unwrap();
        assert!(
            db.upsert_working_renewal(&d).is_err(),
            "rows without a zone share one ranking"
        );
        d.overlay.renewal_order = Some(2);
        db.upsert_working_renewal(&d).unwrap();
    }
}
