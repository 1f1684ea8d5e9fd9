use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{ts_from_sql, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    fn from_sql(idx: usize, raw: String) -> rusqlite::Result<Self> {
        match raw.as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("unknown delivery status '{other}'").into(),
            )),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

/// One attempted delivery to one recipient for one campaign. The
/// (campaign_id, customer_id) pair is unique, which is what makes dispatch
/// retries and duplicate receipts collapse instead of double-counting.
#[derive(Debug, Clone, Serialize)]
pub struct CommunicationLog {
    pub id: String,
    pub campaign_id: i64,
    pub customer_id: i64,
    pub message: String,
    pub status: DeliveryStatus,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of queueing a recipient: either a fresh pending row or a
/// conflict with a row from an earlier dispatch of the same campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued(String),
    AlreadyDispatched,
}

const LOG_SELECT: &str = "SELECT id, campaign_id, customer_id, message, status, failure_reason, updated_at FROM communication_log";

#[derive(Clone)]
pub struct CommLogStore {
    db: Database,
}

impl CommLogStore {
    pub fn new(db: Database) -> Self {
        CommLogStore { db }
    }

    /// Insert a pending row for this (campaign, recipient) pair. A
    /// concurrent or repeated dispatch loses the uniqueness race at the
    /// storage layer and is reported as AlreadyDispatched, not an error.
    pub fn queue(&self, campaign_id: i64, customer_id: i64, message: &str) -> Result<QueueOutcome> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO communication_log
                 (id, campaign_id, customer_id, message, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, campaign_id, customer_id, message, Utc::now().to_rfc3339()],
        )?;
        if inserted == 0 {
            Ok(QueueOutcome::AlreadyDispatched)
        } else {
            Ok(QueueOutcome::Queued(id))
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<CommunicationLog>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(&format!("{LOG_SELECT} WHERE id = ?1"), params![id], Self::map_row)
            .optional()?;
        Ok(row)
    }

    /// Flip a pending row to its terminal status. Returns false when the
    /// row was already terminal, so exactly one caller ever wins even when
    /// receipts race.
    pub fn mark_terminal(
        &self,
        id: &str,
        status: DeliveryStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE communication_log
             SET status = ?1, failure_reason = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![status.as_str(), failure_reason, Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn list_for_campaign(&self, campaign_id: i64) -> Result<Vec<CommunicationLog>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!("{LOG_SELECT} WHERE campaign_id = ?1 ORDER BY updated_at"))?;
        let rows = stmt
            .query_map(params![campaign_id], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Terminal-outcome counts for one campaign: (sent, failed, pending).
    pub fn status_counts(&self, campaign_id: i64) -> Result<(i64, i64, i64)> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT
                COALESCE(SUM(status = 'sent'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'pending'), 0)
             FROM communication_log WHERE campaign_id = ?1",
            params![campaign_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(Into::into)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommunicationLog> {
        Ok(CommunicationLog {
            id: row.get(0)?,
            campaign_id: row.get(1)?,
            customer_id: row.get(2)?,
            message: row.get(3)?,
            status: DeliveryStatus::from_sql(4, row.get(4)?)?,
            failure_reason: row.get(5)?,
            updated_at: ts_from_sql(6, row.get(6)?)?,
        })
    }
}
