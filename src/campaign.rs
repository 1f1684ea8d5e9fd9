use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::comm_log::{CommLogStore, DeliveryStatus};
use crate::rules::{RuleError, RuleNode};
use crate::store::{ts_from_sql, Database};

/// Aggregate delivery counters. `pending` is always derived from
/// `total_recipients - sent - failed`, never stored, so the books can't
/// disagree with themselves.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeliveryStats {
    pub sent: i64,
    pub failed: i64,
    pub pending: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub rules: RuleNode,
    pub message_template: String,
    pub total_recipients: i64,
    pub stats: DeliveryStats,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    /// A campaign settles once every queued recipient has a terminal outcome.
    pub fn is_settled(&self) -> bool {
        self.stats.pending == 0
    }
}

/// One campaign whose stored counters disagreed with its terminal log rows.
#[derive(Debug, Clone, Serialize)]
pub struct StatDrift {
    pub campaign_id: i64,
    pub recorded_sent: i64,
    pub recorded_failed: i64,
    pub actual_sent: i64,
    pub actual_failed: i64,
    pub pending: i64,
}

const CAMPAIGN_SELECT: &str = "SELECT id, name, rules, message_template, total_recipients, sent, failed, created_at FROM campaigns";

#[derive(Clone)]
pub struct CampaignStore {
    db: Database,
}

impl CampaignStore {
    pub fn new(db: Database) -> Self {
        CampaignStore { db }
    }

    /// Create a campaign. The rule tree is validated here, before anything
    /// is stored: a malformed tree must never reach dispatch.
    pub fn create(
        &self,
        name: &str,
        rules: &RuleNode,
        message_template: &str,
    ) -> Result<Campaign, CampaignCreateError> {
        rules.validate()?;
        let rules_json = serde_json::to_string(rules).map_err(anyhow::Error::from)?;
        let now = Utc::now();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO campaigns (name, rules, message_template, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, rules_json, message_template, now.to_rfc3339()],
        )
        .map_err(anyhow::Error::from)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get(id)?
            .ok_or_else(|| anyhow!("campaign {id} vanished after insert").into())
    }

    pub fn get(&self, id: i64) -> Result<Option<Campaign>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(&format!("{CAMPAIGN_SELECT} WHERE id = ?1"), params![id], Self::map_row)
            .optional()?;
        Ok(row)
    }

    pub fn list(&self) -> Result<Vec<Campaign>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!("{CAMPAIGN_SELECT} ORDER BY created_at DESC"))?;
        let rows = stmt
            .query_map([], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Grow the recipient total as dispatch queues rows. Single-statement
    /// increment, so concurrent dispatchers cannot lose updates.
    pub fn add_recipients(&self, id: i64, n: i64) -> Result<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE campaigns SET total_recipients = total_recipients + ?1 WHERE id = ?2",
            params![n, id],
        )?;
        if changed == 0 {
            return Err(anyhow!("campaign {id} not found"));
        }
        Ok(())
    }

    /// Count one terminal outcome against the campaign. Also a
    /// single-statement atomic increment; reconciliations for different
    /// recipients of the same campaign serialize at the storage layer.
    pub fn record_outcome(&self, id: i64, status: DeliveryStatus) -> Result<()> {
        let column = match status {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Pending => return Err(anyhow!("pending is not a terminal outcome")),
        };
        let conn = self.db.lock();
        let changed = conn.execute(
            &format!("UPDATE campaigns SET {column} = {column} + 1 WHERE id = ?1"),
            params![id],
        )?;
        if changed == 0 {
            return Err(anyhow!("campaign {id} not found"));
        }
        Ok(())
    }

    /// Compare every campaign's stored counters against its terminal log
    /// rows and rewrite the ones that drifted (a stat update that failed
    /// after a log flip leaves exactly this signature). Returns the
    /// drift records, already repaired when `repair` is set.
    pub fn audit_stats(&self, logs: &CommLogStore, repair: bool) -> Result<Vec<StatDrift>> {
        let campaigns = self.list()?;
        let mut drifted = Vec::new();
        for campaign in campaigns {
            let (sent, failed, pending) = logs.status_counts(campaign.id)?;
            if sent == campaign.stats.sent && failed == campaign.stats.failed {
                continue;
            }
            log::warn!(
                "campaign {} stats drifted: recorded sent={} failed={}, logs say sent={} failed={}",
                campaign.id,
                campaign.stats.sent,
                campaign.stats.failed,
                sent,
                failed
            );
            if repair {
                let conn = self.db.lock();
                conn.execute(
                    "UPDATE campaigns SET sent = ?1, failed = ?2 WHERE id = ?3",
                    params![sent, failed, campaign.id],
                )?;
            }
            drifted.push(StatDrift {
                campaign_id: campaign.id,
                recorded_sent: campaign.stats.sent,
                recorded_failed: campaign.stats.failed,
                actual_sent: sent,
                actual_failed: failed,
                pending,
            });
        }
        Ok(drifted)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
        let rules_json: String = row.get(2)?;
        let rules: RuleNode = serde_json::from_str(&rules_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let total_recipients: i64 = row.get(4)?;
        let sent: i64 = row.get(5)?;
        let failed: i64 = row.get(6)?;
        Ok(Campaign {
            id: row.get(0)?,
            name: row.get(1)?,
            rules,
            message_template: row.get(3)?,
            total_recipients,
            stats: DeliveryStats {
                sent,
                failed,
                pending: total_recipients - sent - failed,
            },
            created_at: ts_from_sql(7, row.get(7)?)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CampaignCreateError {
    #[error("invalid audience rules: {0}")]
    InvalidRules(#[from] RuleError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
