use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    pub database_path: String,
    /// When set, every API route except /health and the vendor receipt
    /// callback requires this key.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_page_size")]
    pub audience_page_size: u32,
    #[serde(default)]
    pub vendor: VendorSettings,
    #[serde(default)]
    pub assist: AssistSettings,
}

/// Delivery-simulation knobs. Probability and latency stay configurable so
/// tests can pin the outcome instead of fighting the dice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorSettings {
    #[serde(default)]
    pub mode: VendorMode,
    #[serde(default = "default_success_probability")]
    pub success_probability: f64,
    #[serde(default = "default_latency_min")]
    pub latency_ms_min: u64,
    #[serde(default = "default_latency_max")]
    pub latency_ms_max: u64,
    /// Where callback-mode receipts are POSTed. Usually this service's own
    /// /api/receipt route.
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VendorMode {
    /// The send call itself returns the delivery outcome.
    #[default]
    Sync,
    /// The send call only acknowledges acceptance; the outcome arrives
    /// later on the receipt endpoint.
    Callback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistSettings {
    /// Generative endpoint for audience descriptions and campaign goals.
    /// Unset is fine: rule generation fails fast and message generation
    /// falls back to the canned template.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_assist_timeout")]
    pub timeout_seconds: u64,
}

impl Default for VendorSettings {
    fn default() -> Self {
        VendorSettings {
            mode: VendorMode::Sync,
            success_probability: default_success_probability(),
            latency_ms_min: default_latency_min(),
            latency_ms_max: default_latency_max(),
            callback_url: None,
        }
    }
}

impl Default for AssistSettings {
    fn default() -> Self {
        AssistSettings {
            endpoint: None,
            models: default_models(),
            timeout_seconds: default_assist_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_path: "/var/lib/campaignd/campaignd.db".to_string(),
            api_key: None,
            audience_page_size: default_page_size(),
            vendor: VendorSettings::default(),
            assist: AssistSettings::default(),
        }
    }
}

fn default_page_size() -> u32 {
    200
}

fn default_success_probability() -> f64 {
    0.9
}

fn default_latency_min() -> u64 {
    100
}

fn default_latency_max() -> u64 {
    500
}

fn default_models() -> Vec<String> {
    vec![
        "gemini-2.0-flash-lite".to_string(),
        "gemini-1.5-flash".to_string(),
        "gemini-1.5-pro".to_string(),
    ]
}

fn default_assist_timeout() -> u64 {
    15
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.vendor.success_probability) {
            anyhow::bail!(
                "vendor.success_probability must be within [0, 1], got {}",
                self.vendor.success_probability
            );
        }
        if self.vendor.latency_ms_min > self.vendor.latency_ms_max {
            anyhow::bail!(
                "vendor.latency_ms_min ({}) exceeds latency_ms_max ({})",
                self.vendor.latency_ms_min,
                self.vendor.latency_ms_max
            );
        }
        if self.vendor.mode == VendorMode::Callback && self.vendor.callback_url.is_none() {
            anyhow::bail!("vendor.mode is 'callback' but vendor.callback_url is not set");
        }
        if self.audience_page_size == 0 {
            anyhow::bail!("audience_page_size must be at least 1");
        }
        Ok(())
    }
}
