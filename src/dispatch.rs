use std::sync::Arc;

use serde::Serialize;

use crate::audience::AudienceSelector;
use crate::campaign::CampaignStore;
use crate::comm_log::{CommLogStore, QueueOutcome};
use crate::reconcile::{Receipt, ReceiptReconciler};
use crate::rules::RuleError;
use crate::vendor::{VendorClient, VendorResponse};

/// What a dispatch call reports back: rows queued fresh versus recipients
/// skipped because an earlier dispatch already queued them.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DispatchSummary {
    pub queued: usize,
    pub skipped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("campaign {0} not found")]
    CampaignNotFound(i64),
    #[error("campaign {0} has invalid audience rules: {1}")]
    InvalidRules(i64, RuleError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Fans a campaign out to its audience: one pending communication row per
/// recipient, one detached send task per row. Delivery outcomes flow back
/// through the reconciler, never through this call's return value.
#[derive(Clone)]
pub struct Dispatcher {
    campaigns: CampaignStore,
    logs: CommLogStore,
    audience: AudienceSelector,
    vendor: Arc<dyn VendorClient>,
    reconciler: ReceiptReconciler,
}

impl Dispatcher {
    pub fn new(
        campaigns: CampaignStore,
        logs: CommLogStore,
        audience: AudienceSelector,
        vendor: Arc<dyn VendorClient>,
        reconciler: ReceiptReconciler,
    ) -> Self {
        Dispatcher {
            campaigns,
            logs,
            audience,
            vendor,
            reconciler,
        }
    }

    /// Substitute the recipient's display name into a campaign template.
    pub fn render_message(template: &str, name: &str) -> String {
        template.replace("{{name}}", name)
    }

    pub async fn dispatch(&self, campaign_id: i64) -> Result<DispatchSummary, DispatchError> {
        let campaign = self
            .campaigns
            .get(campaign_id)?
            .ok_or(DispatchError::CampaignNotFound(campaign_id))?;
        // Stored trees were validated at creation; re-check so a hand-edited
        // row fails here instead of half-way through the audience.
        campaign
            .rules
            .validate()
            .map_err(|e| DispatchError::InvalidRules(campaign_id, e))?;

        let mut summary = DispatchSummary::default();
        let mut audience = self.audience.select(&campaign.rules);

        while let Some(recipient) = audience.try_next()? {
            let message = Self::render_message(&campaign.message_template, &recipient.name);
            match self.logs.queue(campaign_id, recipient.id, &message)? {
                QueueOutcome::AlreadyDispatched => {
                    log::debug!(
                        "campaign {campaign_id}: customer {} already dispatched, skipping",
                        recipient.id
                    );
                    summary.skipped += 1;
                }
                QueueOutcome::Queued(communication_id) => {
                    // Count the recipient before the send starts so derived
                    // pending can never go negative when a receipt races in.
                    self.campaigns.add_recipients(campaign_id, 1)?;
                    summary.queued += 1;
                    self.spawn_send(communication_id, recipient.email.clone(), message);
                }
            }
        }

        log::info!(
            "campaign {campaign_id}: dispatch queued {} recipient(s), skipped {}",
            summary.queued,
            summary.skipped
        );
        Ok(summary)
    }

    /// Fire-and-forget send. No store lock is held while the vendor call
    /// is in flight, and one recipient's failure never aborts the rest.
    fn spawn_send(&self, communication_id: String, recipient: String, message: String) {
        let vendor = Arc::clone(&self.vendor);
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            let receipt = match vendor.send(&communication_id, &recipient, &message).await {
                Ok(VendorResponse::Delivered) => Receipt::sent(),
                Ok(VendorResponse::Failed(reason)) => Receipt::failed(reason),
                Ok(VendorResponse::Accepted) => {
                    log::debug!("communication {communication_id} accepted, awaiting callback");
                    return;
                }
                Err(e) => Receipt::failed(format!("vendor unreachable: {e}")),
            };
            if let Err(e) = reconciler.reconcile(&communication_id, &receipt) {
                log::warn!("receipt for communication {communication_id} not applied: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::Campaign;
    use crate::customer::{CustomerStore, NewCustomer};
    use crate::rules::{RuleField, RuleNode, RuleOp, RuleValue};
    use crate::store::Database;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Vendor double that replays a fixed outcome sequence.
    struct ScriptedVendor {
        outcomes: Mutex<VecDeque<VendorResponse>>,
    }

    impl ScriptedVendor {
        fn new(outcomes: Vec<VendorResponse>) -> Self {
            ScriptedVendor {
                outcomes: Mutex::new(outcomes.into()),
            }
        }
    }

    #[async_trait]
    impl VendorClient for ScriptedVendor {
        async fn send(&self, _id: &str, _to: &str, _msg: &str) -> anyhow::Result<VendorResponse> {
            let next = self.outcomes.lock().unwrap().pop_front();
            Ok(next.unwrap_or(VendorResponse::Delivered))
        }
    }

    /// Vendor double whose invocation itself fails.
    struct UnreachableVendor;

    #[async_trait]
    impl VendorClient for UnreachableVendor {
        async fn send(&self, _id: &str, _to: &str, _msg: &str) -> anyhow::Result<VendorResponse> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    struct Fixture {
        campaigns: CampaignStore,
        logs: CommLogStore,
        customers: CustomerStore,
        dispatcher: Dispatcher,
    }

    fn fixture(vendor: Arc<dyn VendorClient>, customer_count: usize) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let campaigns = CampaignStore::new(db.clone());
        let logs = CommLogStore::new(db.clone());
        let customers = CustomerStore::new(db);
        for i in 0..customer_count {
            customers
                .create(&NewCustomer {
                    name: format!("Customer {i}"),
                    email: format!("c{i}@example.com"),
                    phone: None,
                })
                .unwrap();
        }
        let audience = AudienceSelector::new(customers.clone(), 2);
        let reconciler = ReceiptReconciler::new(logs.clone(), campaigns.clone());
        let dispatcher = Dispatcher::new(
            campaigns.clone(),
            logs.clone(),
            audience,
            vendor,
            reconciler,
        );
        Fixture {
            campaigns,
            logs,
            customers,
            dispatcher,
        }
    }

    fn everyone() -> RuleNode {
        RuleNode::Leaf {
            field: RuleField::Visits,
            operator: RuleOp::Ge,
            value: RuleValue::Number(0.0),
        }
    }

    async fn wait_settled(campaigns: &CampaignStore, id: i64) -> Campaign {
        for _ in 0..200 {
            let campaign = campaigns.get(id).unwrap().unwrap();
            if campaign.is_settled() {
                return campaign;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("campaign {id} never settled");
    }

    #[tokio::test]
    async fn test_dispatch_settles_mixed_outcomes() {
        let vendor = Arc::new(ScriptedVendor::new(vec![
            VendorResponse::Delivered,
            VendorResponse::Failed("mailbox full".to_string()),
            VendorResponse::Delivered,
        ]));
        let f = fixture(vendor, 3);
        let campaign = f
            .campaigns
            .create("spring", &everyone(), "Hello {{name}}!")
            .unwrap();

        let summary = f.dispatcher.dispatch(campaign.id).await.unwrap();
        assert_eq!(summary.queued, 3);
        assert_eq!(summary.skipped, 0);

        let settled = wait_settled(&f.campaigns, campaign.id).await;
        assert_eq!(settled.total_recipients, 3);
        assert_eq!(settled.stats.sent, 2);
        assert_eq!(settled.stats.failed, 1);
        assert_eq!(settled.stats.pending, 0);

        // Each recipient got a personalized rendering.
        let rows = f.logs.list_for_campaign(campaign.id).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().any(|r| r.message == "Hello Customer 0!"));
    }

    #[tokio::test]
    async fn test_redispatch_creates_no_second_row() {
        let vendor = Arc::new(ScriptedVendor::new(vec![]));
        let f = fixture(vendor, 3);
        let campaign = f.campaigns.create("c", &everyone(), "Hi {{name}}").unwrap();

        let first = f.dispatcher.dispatch(campaign.id).await.unwrap();
        assert_eq!(first.queued, 3);
        wait_settled(&f.campaigns, campaign.id).await;

        let second = f.dispatcher.dispatch(campaign.id).await.unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.skipped, 3);

        let campaign = f.campaigns.get(campaign.id).unwrap().unwrap();
        assert_eq!(campaign.total_recipients, 3);
        assert_eq!(f.logs.list_for_campaign(campaign.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_vendor_fails_recipients_without_aborting() {
        let f = fixture(Arc::new(UnreachableVendor), 4);
        let campaign = f.campaigns.create("c", &everyone(), "Hi {{name}}").unwrap();

        let summary = f.dispatcher.dispatch(campaign.id).await.unwrap();
        assert_eq!(summary.queued, 4);

        let settled = wait_settled(&f.campaigns, campaign.id).await;
        assert_eq!(settled.stats.failed, 4);
        assert_eq!(settled.stats.sent, 0);

        let rows = f.logs.list_for_campaign(campaign.id).unwrap();
        assert!(rows
            .iter()
            .all(|r| r.failure_reason.as_deref().unwrap().starts_with("vendor unreachable")));
    }

    #[tokio::test]
    async fn test_accepted_sends_stay_pending_until_callback() {
        let vendor = Arc::new(ScriptedVendor::new(vec![
            VendorResponse::Accepted,
            VendorResponse::Accepted,
        ]));
        let f = fixture(vendor, 2);
        let campaign = f.campaigns.create("c", &everyone(), "Hi {{name}}").unwrap();

        f.dispatcher.dispatch(campaign.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let campaign = f.campaigns.get(campaign.id).unwrap().unwrap();
        assert_eq!(campaign.stats.pending, 2);

        // The late callback settles them through the reconciler.
        for row in f.logs.list_for_campaign(campaign.id).unwrap() {
            f.dispatcher
                .reconciler
                .reconcile(&row.id, &Receipt::sent())
                .unwrap();
        }
        let campaign = f.campaigns.get(campaign.id).unwrap().unwrap();
        assert_eq!(campaign.stats.sent, 2);
        assert_eq!(campaign.stats.pending, 0);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_campaign() {
        let f = fixture(Arc::new(ScriptedVendor::new(vec![])), 0);
        assert!(matches!(
            f.dispatcher.dispatch(42).await,
            Err(DispatchError::CampaignNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_audience_rules_filter_recipients() {
        let vendor = Arc::new(ScriptedVendor::new(vec![]));
        let f = fixture(vendor, 3);
        // Only one customer crosses the spend threshold.
        let big = f.customers.list(10, 0).unwrap()[0].id;
        f.customers.record_order(big, 5000.0).unwrap();

        let rule = RuleNode::Leaf {
            field: RuleField::TotalSpend,
            operator: RuleOp::Gt,
            value: RuleValue::Number(1000.0),
        };
        let campaign = f.campaigns.create("vip", &rule, "Hi {{name}}").unwrap();
        let summary = f.dispatcher.dispatch(campaign.id).await.unwrap();
        assert_eq!(summary.queued, 1);
    }

    #[test]
    fn test_render_message() {
        assert_eq!(
            Dispatcher::render_message("Hello {{name}}, welcome back!", "Ada"),
            "Hello Ada, welcome back!"
        );
        // Templates without the placeholder pass through untouched.
        assert_eq!(Dispatcher::render_message("Flash sale today", "Ada"), "Flash sale today");
    }
}
