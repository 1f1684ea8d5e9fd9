use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::store::{opt_ts_from_sql, ts_from_sql, Database};

/// Segmentation source record. The delivery pipeline only ever reads these;
/// writes come through the customer management endpoints and order intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub total_spend: f64,
    pub visits: i64,
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCustomer {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CustomerError {
    #[error("customer with this email already exists")]
    DuplicateEmail,
    #[error("invalid customer record: {0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

const CUSTOMER_SELECT: &str = "SELECT id, name, email, phone, total_spend, visits, last_activity, created_at FROM customers";

#[derive(Clone)]
pub struct CustomerStore {
    db: Database,
    email_re: Regex,
}

impl CustomerStore {
    pub fn new(db: Database) -> Self {
        CustomerStore {
            db,
            // Shape check only; deliverability is the vendor's problem.
            email_re: Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap(),
        }
    }

    fn normalize(&self, input: &NewCustomer) -> Result<NewCustomer, CustomerError> {
        let name = input.name.trim().to_string();
        let email = input.email.trim().to_lowercase();
        if name.is_empty() {
            return Err(CustomerError::Invalid("name is required".to_string()));
        }
        if !self.email_re.is_match(&email) {
            return Err(CustomerError::Invalid(format!("'{email}' is not an email address")));
        }
        Ok(NewCustomer {
            name,
            email,
            phone: input.phone.as_deref().map(|p| p.trim().to_string()),
        })
    }

    pub fn create(&self, input: &NewCustomer) -> Result<Customer, CustomerError> {
        let record = self.normalize(input)?;
        let now = Utc::now();
        let conn = self.db.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO customers (name, email, phone, last_activity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.name,
                    record.email,
                    record.phone,
                    now.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .map_err(anyhow::Error::from)?;
        if inserted == 0 {
            return Err(CustomerError::DuplicateEmail);
        }
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get(id)
            .map_err(CustomerError::Storage)?
            .ok_or_else(|| CustomerError::Storage(anyhow::anyhow!("customer {id} vanished after insert")))
    }

    pub fn get(&self, id: i64) -> Result<Option<Customer>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("{CUSTOMER_SELECT} WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<Customer>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare(&format!("{CUSTOMER_SELECT} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"))?;
        let rows = stmt
            .query_map(params![limit, offset], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Keyset page for audience scans: rows with id greater than `after_id`,
    /// in id order. Stable across a scan even while new customers arrive.
    pub fn page_after(&self, after_id: i64, limit: u32) -> Result<Vec<Customer>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare(&format!("{CUSTOMER_SELECT} WHERE id > ?1 ORDER BY id LIMIT ?2"))?;
        let rows = stmt
            .query_map(params![after_id, limit], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.db.lock();
        let n = conn.query_row("SELECT COUNT(*) FROM customers", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Rewrite a customer's contact fields. Segmentation aggregates are
    /// untouched; those only move through record_order.
    pub fn update(&self, id: i64, input: &NewCustomer) -> Result<Option<Customer>, CustomerError> {
        let record = self.normalize(input)?;
        let conn = self.db.lock();
        let changed = conn
            .execute(
                "UPDATE customers SET name = ?1, email = ?2, phone = ?3 WHERE id = ?4",
                params![record.name, record.email, record.phone, id],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    CustomerError::DuplicateEmail
                }
                other => CustomerError::Storage(other.into()),
            })?;
        drop(conn);
        if changed == 0 {
            return Ok(None);
        }
        self.get(id).map_err(CustomerError::Storage)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute("DELETE FROM customers WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Import many customers at once. Rows failing the shape checks or
    /// colliding on email are counted as skipped, the rest go in.
    pub fn bulk_import(&self, inputs: &[NewCustomer]) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for input in inputs {
            match self.create(input) {
                Ok(_) => summary.imported += 1,
                Err(CustomerError::DuplicateEmail) | Err(CustomerError::Invalid(_)) => {
                    summary.skipped += 1
                }
                Err(CustomerError::Storage(e)) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Fold one order into the segmentation aggregates.
    pub fn record_order(&self, customer_id: i64, amount: f64) -> Result<bool> {
        let now = Utc::now();
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE customers
             SET total_spend = total_spend + ?1, visits = visits + 1, last_activity = ?2
             WHERE id = ?3",
            params![amount, now.to_rfc3339(), customer_id],
        )?;
        Ok(changed > 0)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
        Ok(Customer {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            total_spend: row.get(4)?,
            visits: row.get(5)?,
            last_activity: opt_ts_from_sql(6, row.get(6)?)?,
            created_at: ts_from_sql(7, row.get(7)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CustomerStore {
        CustomerStore::new(Database::open_in_memory().unwrap())
    }

    fn new_customer(name: &str, email: &str) -> NewCustomer {
        NewCustomer {
            name: name.to_string(),
            email: email.to_string(),
            phone: None,
        }
    }

    #[test]
    fn test_create_normalizes_and_rejects_duplicates() {
        let store = store();
        let created = store
            .create(&new_customer("  Ada Lovelace ", " Ada@Example.COM "))
            .unwrap();
        assert_eq!(created.name, "Ada Lovelace");
        assert_eq!(created.email, "ada@example.com");
        assert_eq!(created.visits, 0);

        let err = store
            .create(&new_customer("Other", "ada@example.com"))
            .unwrap_err();
        assert!(matches!(err, CustomerError::DuplicateEmail));
    }

    #[test]
    fn test_create_rejects_bad_shapes() {
        let store = store();
        assert!(matches!(
            store.create(&new_customer("", "a@example.com")),
            Err(CustomerError::Invalid(_))
        ));
        assert!(matches!(
            store.create(&new_customer("Ada", "not-an-email")),
            Err(CustomerError::Invalid(_))
        ));
    }

    #[test]
    fn test_bulk_import_counts_valid_and_skipped() {
        let store = store();
        store.create(&new_customer("Ada", "ada@example.com")).unwrap();

        let summary = store
            .bulk_import(&[
                new_customer("Grace", "grace@example.com"),
                new_customer("Ada", "ada@example.com"), // duplicate
                new_customer("", "blank@example.com"),  // invalid
            ])
            .unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_record_order_accrues_aggregates() {
        let store = store();
        let c = store.create(&new_customer("Ada", "ada@example.com")).unwrap();

        assert!(store.record_order(c.id, 120.50).unwrap());
        assert!(store.record_order(c.id, 79.50).unwrap());
        let c = store.get(c.id).unwrap().unwrap();
        assert!((c.total_spend - 200.0).abs() < 1e-9);
        assert_eq!(c.visits, 2);
        assert!(c.last_activity.is_some());

        assert!(!store.record_order(9999, 10.0).unwrap());
    }

    #[test]
    fn test_update_and_delete() {
        let store = store();
        let a = store.create(&new_customer("Ada", "ada@example.com")).unwrap();
        let b = store.create(&new_customer("Grace", "grace@example.com")).unwrap();
        store.record_order(a.id, 300.0).unwrap();

        let updated = store
            .update(a.id, &new_customer("Ada Lovelace", "ada.l@example.com"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Ada Lovelace");
        assert_eq!(updated.email, "ada.l@example.com");
        // Aggregates survive contact edits.
        assert!((updated.total_spend - 300.0).abs() < 1e-9);

        // Moving onto another customer's email is a conflict.
        let err = store
            .update(a.id, &new_customer("Ada", "grace@example.com"))
            .unwrap_err();
        assert!(matches!(err, CustomerError::DuplicateEmail));

        // Unknown ids report as absent, not as errors.
        assert!(store.update(999, &new_customer("X", "x@example.com")).unwrap().is_none());

        assert!(store.delete(b.id).unwrap());
        assert!(!store.delete(b.id).unwrap());
        assert!(store.get(b.id).unwrap().is_none());
    }

    #[test]
    fn test_page_after_walks_in_id_order() {
        let store = store();
        for i in 0..5 {
            store
                .create(&new_customer("C", &format!("c{i}@example.com")))
                .unwrap();
        }

        let first = store.page_after(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let next = store.page_after(first.last().unwrap().id, 10).unwrap();
        assert_eq!(next.len(), 3);
        assert!(next.iter().all(|c| c.id > first.last().unwrap().id));
    }
}
