use std::collections::HashMap;

use rusqlite::{params, params_from_iter};

use super::*;

impl RenewalDb {
    // =========================================================================
    // Quotes
    // =========================================================================

    pub fn insert_quote(&self, quote: &NewQuote, now: &str) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO quotes (policy_id, class, insurer, premium, broker_fee, comments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                quote.policy_id,
                quote.class,
                quote.insurer,
                quote.premium,
                quote.broker_fee,
                quote.comments,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Drop every quote attached to a renewal. Returns the number removed.
    pub fn delete_quotes_for_policy(&self, policy_id: &str) -> Result<usize, DbError> {
        Ok(self
            .conn
            .execute("DELETE FROM quotes WHERE policy_id = ?1", params![policy_id])?)
    }

    pub fn get_quotes_for_policy(&self, policy_id: &str) -> Result<Vec<DbQuote>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, policy_id, class, insurer, premium, broker_fee, comments, created_at
             FROM quotes WHERE policy_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![policy_id], Self::map_quote_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Quotes for many renewals in one query, grouped by policy in insertion order.
    ///
    /// Avoids an N+1 round trip when building a filtered renewal listing.
    pub fn get_quotes_for_policies(
        &self,
        policy_ids: &[String],
    ) -> Result<HashMap<String, Vec<DbQuote>>, DbError> {
        let mut grouped: HashMap<String, Vec<DbQuote>> = HashMap::new();
        if policy_ids.is_empty() {
            return Ok(grouped);
        }

        let placeholders = vec!["?"; policy_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, policy_id, class, insurer, premium, broker_fee, comments, created_at
             FROM quotes WHERE policy_id IN ({placeholders}) ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(policy_ids.iter()), Self::map_quote_row)?;
        for row in rows {
            let quote = row?;
            grouped.entry(quote.policy_id.clone()).or_default().push(quote);
        }
        Ok(grouped)
    }

    fn map_quote_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbQuote> {
        Ok(DbQuote {
            id: row.get(0)?,
            policy_id: row.get(1)?,
            class: row.get(2)?,
            insurer: row.get(3)?,
            premium: row.get(4)?,
            broker_fee: row.get(5)?,
            comments: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{test_db, working_row};
    use super::*;

    const T0: &str = "2025-01-01T00:00:00+00:00";

    fn quote(policy_id: &str, insurer: &str, premium: f64) -> NewQuote {
        NewQuote {
            policy_id: policy_id.to_string(),
            class: Some("Property - Buildings".to_string()),
            insurer: Some(insurer.to_string()),
            premium: Some(premium),
            broker_fee: Some(premium / 10.0),
            comments: None,
        }
    }

    #[test]
    fn test_quotes_grouped_in_insertion_order() {
        let db = test_db();
        working_row(&db, "POL-1", "Jane Doe", T0);
        working_row(&db, "POL-2", "Jane Doe", T0);
        db.insert_quote(&quote("POL-1", "AXA", 22000.0), T0).unwrap();
        db.insert_quote(&quote("POL-2", "Zurich", 16000.0), T0).unwrap();
        db.insert_quote(&quote("POL-1", "Allianz", 24500.0), T0).unwrap();

        let grouped = db
            .get_quotes_for_policies(&["POL-1".to_string(), "POL-2".to_string()])
            .unwrap();
        let insurers: Vec<_> = grouped["POL-1"]
            .iter()
            .map(|q| q.insurer.clone().unwrap())
            .collect();
        assert_eq!(insurers, vec!["AXA", "Allianz"]);
        assert_eq!(grouped["POL-2"].len(), 1);
    }

    #[test]
    fn test_quote_requires_parent_renewal() {
        let db = test_db();
        assert!(db.insert_quote(&quote("POL-404", "AXA", 1.0), T0).is_err());
    }

    #[test]
    fn test_quotes_cascade_with_parent() {
        let db = test_db();
        working_row(&db, "POL-1", "Jane Doe", T0);
        db.insert_quote(&quote("POL-1", "AXA", 22000.0), T0).unwrap();

        db.conn_ref()
            .execute("DELETE FROM zone_working WHERE policy_id = 'POL-1'", [])
            .unwrap();
        assert!(db.get_quotes_for_policy("POL-1").unwrap().is_empty());
    }

    #[test]
    fn test_empty_policy_list_skips_query() {
        let db = test_db();
        assert!(db.get_quotes_for_policies(&[]).unwrap().is_empty());
    }
}
