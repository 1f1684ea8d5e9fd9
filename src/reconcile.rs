use serde::Deserialize;

use crate::campaign::CampaignStore;
use crate::comm_log::{CommLogStore, DeliveryStatus};

/// A delivery receipt, whichever way it arrived: the vendor's immediate
/// return value or a later callback on the receipt endpoint. Both paths
/// funnel into the same reconciliation entry point, and it is the entry
/// point's idempotence that makes that race safe.
#[derive(Debug, Clone, Deserialize)]
pub struct Receipt {
    pub status: DeliveryStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Receipt {
    pub fn sent() -> Self {
        Receipt {
            status: DeliveryStatus::Sent,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Receipt {
            status: DeliveryStatus::Failed,
            failure_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileResult {
    /// False when the receipt was a duplicate or arrived after a
    /// concurrent receipt already settled the row.
    pub applied: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("unknown communication id: {0}")]
    UnknownReceipt(String),
    #[error("receipt carried non-terminal status 'pending'")]
    NonTerminalStatus,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Applies delivery receipts exactly once: flips the communication row to
/// its terminal state, then counts the outcome against the owning
/// campaign's aggregates.
#[derive(Clone)]
pub struct ReceiptReconciler {
    logs: CommLogStore,
    campaigns: CampaignStore,
}

impl ReceiptReconciler {
    pub fn new(logs: CommLogStore, campaigns: CampaignStore) -> Self {
        ReceiptReconciler { logs, campaigns }
    }

    pub fn reconcile(
        &self,
        communication_id: &str,
        receipt: &Receipt,
    ) -> Result<ReconcileResult, ReconcileError> {
        if !receipt.status.is_terminal() {
            return Err(ReconcileError::NonTerminalStatus);
        }

        let row = self
            .logs
            .get(communication_id)?
            .ok_or_else(|| ReconcileError::UnknownReceipt(communication_id.to_string()))?;

        if row.status.is_terminal() {
            log::debug!(
                "duplicate receipt for communication {communication_id} (already {})",
                row.status.as_str()
            );
            return Ok(ReconcileResult { applied: false });
        }

        // Conditional flip: when two receipts race, only one sees a row
        // still pending, and only that one reaches the stat update below.
        let won = self.logs.mark_terminal(
            communication_id,
            receipt.status,
            receipt.failure_reason.as_deref(),
        )?;
        if !won {
            return Ok(ReconcileResult { applied: false });
        }

        log::info!(
            "communication {communication_id} settled as {}",
            receipt.status.as_str()
        );

        // The log row is the source of truth. If the campaign counter
        // update fails after the flip, the books undercount until the
        // stats audit recomputes them from the log.
        if let Err(e) = self.campaigns.record_outcome(row.campaign_id, receipt.status) {
            log::error!(
                "campaign {} stats not updated for communication {communication_id}: {e}; \
                 stats audit required",
                row.campaign_id
            );
        }

        Ok(ReconcileResult { applied: true })
    }
}
