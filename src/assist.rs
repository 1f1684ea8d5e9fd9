use serde::Deserialize;
use std::time::Duration;

use crate::config::AssistSettings;
use crate::rules::RuleNode;

/// Fallback promotional copy used whenever message generation is
/// unavailable or comes back unusable. Always carries the name placeholder.
const CANNED_MESSAGE: &str = "Hello {{name}}, thank you for being a valued customer! \
We're excited to offer you exclusive access to our special promotion. Enjoy significant \
discounts on our most popular products and services, designed specifically for loyal \
customers like you. Don't miss this limited-time opportunity - visit our website or \
contact us today to learn more! [Link]";

/// Generated copy shorter than this is treated as a failed generation.
const MIN_MESSAGE_LEN: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum AssistError {
    #[error("rule generation failed: {0}")]
    RuleGenerationFailed(String),
}

#[derive(Debug, Deserialize)]
struct AssistReply {
    text: String,
}

/// Client for the generative collaborator that turns audience descriptions
/// into rule trees and campaign goals into message copy. The provider is a
/// black box behind one HTTP endpoint; each configured model is tried in
/// order and the first usable answer wins.
#[derive(Clone)]
pub struct AssistClient {
    settings: AssistSettings,
    http: reqwest::Client,
}

impl AssistClient {
    pub fn new(settings: AssistSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        AssistClient { settings, http }
    }

    /// Natural-language audience description to a validated rule tree.
    /// Whatever comes back is parsed and validated against the rule
    /// grammar; the collaborator's output is never trusted blindly.
    pub async fn rules_from_description(&self, description: &str) -> Result<RuleNode, AssistError> {
        let prompt = format!(
            "Convert the following customer segment description into a JSON rules object. \
             The object has \"conditions\" (array of {{field, operator, value}}) and a \
             \"condition\" of AND or OR. Valid fields: name, email, totalSpend, visits, \
             lastActivity. Valid operators: >, <, >=, <=, =, !=, contains. \
             Return ONLY the JSON object.\n\nDescription: \"{description}\""
        );
        let text = self
            .generate(&prompt)
            .await
            .map_err(|e| AssistError::RuleGenerationFailed(e.to_string()))?;
        Self::extract_rules(&text)
    }

    /// Campaign goal to message copy. Never fails: anything unusable
    /// degrades to the canned template.
    pub async fn message_for_goal(&self, goal: &str) -> String {
        let prompt = format!(
            "Generate a compelling marketing message for an email or SMS campaign. \
             Include the customer name placeholder exactly as: {{{{name}}}}. Write between \
             250 and 450 characters with a clear call-to-action. Return ONLY the message \
             text.\n\nCampaign information: \"{goal}\""
        );
        match self.generate(&prompt).await {
            Ok(message) if message.len() >= MIN_MESSAGE_LEN && message.contains("{{name}}") => {
                message
            }
            Ok(_) => {
                log::warn!("generated message unusable, using canned template");
                Self::fallback_message()
            }
            Err(e) => {
                log::warn!("message generation failed ({e}), using canned template");
                Self::fallback_message()
            }
        }
    }

    pub fn fallback_message() -> String {
        CANNED_MESSAGE.to_string()
    }

    /// Pull the first {...} block out of the reply and parse it as a rule
    /// tree. Providers love to wrap JSON in prose and code fences.
    fn extract_rules(text: &str) -> Result<RuleNode, AssistError> {
        let start = text
            .find('{')
            .ok_or_else(|| AssistError::RuleGenerationFailed("no JSON object in reply".to_string()))?;
        let end = text
            .rfind('}')
            .ok_or_else(|| AssistError::RuleGenerationFailed("no JSON object in reply".to_string()))?;
        if end < start {
            return Err(AssistError::RuleGenerationFailed(
                "no JSON object in reply".to_string(),
            ));
        }
        let rules: RuleNode = serde_json::from_str(&text[start..=end])
            .map_err(|e| AssistError::RuleGenerationFailed(format!("unparseable rules: {e}")))?;
        rules
            .validate()
            .map_err(|e| AssistError::RuleGenerationFailed(e.to_string()))?;
        Ok(rules)
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let endpoint = self
            .settings
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no assist endpoint configured"))?;

        let mut last_error = anyhow::anyhow!("no models configured");
        for model in &self.settings.models {
            log::debug!("trying assist model {model}");
            let result = self
                .http
                .post(endpoint)
                .json(&serde_json::json!({ "model": model, "prompt": prompt }))
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match result {
                Ok(resp) => match resp.json::<AssistReply>().await {
                    Ok(reply) => return Ok(reply.text.trim().to_string()),
                    Err(e) => {
                        log::debug!("assist model {model} returned a bad payload: {e}");
                        last_error = e.into();
                    }
                },
                Err(e) => {
                    log::debug!("assist model {model} failed: {e}");
                    last_error = e.into();
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssistSettings;

    #[test]
    fn test_fallback_message_carries_placeholder() {
        let message = AssistClient::fallback_message();
        assert!(message.contains("{{name}}"));
        assert!(message.len() >= MIN_MESSAGE_LEN);
    }

    #[test]
    fn test_extract_rules_from_noisy_reply() {
        let reply = r#"Sure! Here is the rules object you asked for:
```json
{"condition": "AND", "conditions": [
    {"field": "totalSpend", "operator": ">", "value": 1000}
]}
```
Let me know if you need anything else."#;
        let rules = AssistClient::extract_rules(reply).unwrap();
        rules.validate().unwrap();
    }

    #[test]
    fn test_extract_rules_rejects_garbage() {
        assert!(AssistClient::extract_rules("no json here").is_err());
        assert!(AssistClient::extract_rules("{\"field\": \"shoeSize\"}").is_err());
        // Valid JSON, invalid grammar.
        let empty_group = r#"{"condition": "AND", "conditions": []}"#;
        assert!(matches!(
            AssistClient::extract_rules(empty_group),
            Err(AssistError::RuleGenerationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_no_endpoint_fails_rules_and_falls_back_for_messages() {
        let client = AssistClient::new(AssistSettings::default());
        assert!(client
            .rules_from_description("customers who spent over $1000")
            .await
            .is_err());

        let message = client.message_for_goal("win back idle customers").await;
        assert_eq!(message, AssistClient::fallback_message());
    }
}
