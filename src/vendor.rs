use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::config::{VendorMode, VendorSettings};

/// What the delivery channel reports for one send attempt. `Accepted`
/// means only "queued with the vendor" and the real outcome arrives later
/// on the receipt endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorResponse {
    Delivered,
    Failed(String),
    Accepted,
}

#[async_trait]
pub trait VendorClient: Send + Sync {
    async fn send(
        &self,
        communication_id: &str,
        recipient: &str,
        message: &str,
    ) -> anyhow::Result<VendorResponse>;
}

/// Stand-in for the real delivery network: random latency inside the
/// configured window, independent per-call failure with the configured
/// probability. In callback mode it acknowledges immediately and POSTs the
/// receipt afterwards, which exercises the same reconciliation path a real
/// vendor webhook would.
pub struct SimulatedVendor {
    settings: VendorSettings,
    http: reqwest::Client,
}

impl SimulatedVendor {
    pub fn new(settings: VendorSettings) -> Self {
        SimulatedVendor {
            settings,
            http: reqwest::Client::new(),
        }
    }

    fn roll_latency(&self) -> Duration {
        let lo = self.settings.latency_ms_min;
        let hi = self.settings.latency_ms_max.max(lo);
        let ms = if lo == hi {
            lo
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        };
        Duration::from_millis(ms)
    }

    fn roll_outcome(&self) -> VendorResponse {
        if rand::thread_rng().gen::<f64>() < self.settings.success_probability {
            VendorResponse::Delivered
        } else {
            VendorResponse::Failed("delivery failed to recipient".to_string())
        }
    }
}

#[async_trait]
impl VendorClient for SimulatedVendor {
    async fn send(
        &self,
        communication_id: &str,
        recipient: &str,
        _message: &str,
    ) -> anyhow::Result<VendorResponse> {
        let latency = self.roll_latency();
        log::debug!("sending communication {communication_id} to {recipient}");
        tokio::time::sleep(latency).await;
        let outcome = self.roll_outcome();

        match self.settings.mode {
            VendorMode::Sync => Ok(outcome),
            VendorMode::Callback => {
                let url = self
                    .settings
                    .callback_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("callback mode requires vendor.callback_url"))?;
                let http = self.http.clone();
                let body = match outcome {
                    VendorResponse::Delivered => serde_json::json!({
                        "communication_id": communication_id,
                        "status": "sent",
                    }),
                    VendorResponse::Failed(reason) => serde_json::json!({
                        "communication_id": communication_id,
                        "status": "failed",
                        "failure_reason": reason,
                    }),
                    VendorResponse::Accepted => unreachable!("roll_outcome never accepts"),
                };
                let id = communication_id.to_string();
                tokio::spawn(async move {
                    let result = http
                        .post(&url)
                        .json(&body)
                        .send()
                        .await
                        .and_then(|resp| resp.error_for_status());
                    if let Err(e) = result {
                        // The communication stays pending; the audit sweep
                        // will surface it.
                        log::warn!("receipt callback for {id} failed: {e}");
                    }
                });
                Ok(VendorResponse::Accepted)
            }
        }
    }
}
