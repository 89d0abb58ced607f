use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::{AlertChannel, AlertMessage};
use crate::{anomaly::Severity, Error, Result};

/// Posts alerts to a Slack incoming webhook.
pub struct SlackChannel {
    client: Client,
    webhook_url: Url,
    channel: Option<String>,
}

impl SlackChannel {
    pub fn new(webhook_url: &str, channel: Option<String>) -> Result<Self> {
        let webhook_url = Url::parse(webhook_url)
            .map_err(|e| Error::Config(format!("Invalid Slack webhook URL: {}", e)))?;
        Ok(Self {
            client: Client::new(),
            webhook_url,
            channel,
        })
    }

    fn payload(&self, message: &AlertMessage) -> Value {
        let color = match message.severity {
            Severity::Critical => "#d00000",
            Severity::Warning => "#f2c744",
            Severity::Info => "#439fe0",
        };
        let mut payload = json!({
            "text": message.title,
            "attachments": [{
                "color": color,
                "text": message.body,
                "footer": format!("fingerprint {}", message.fingerprint),
            }],
        });
        if let Some(channel) = &self.channel {
            payload["channel"] = json!(channel);
        }
        payload
    }
}

/// Map a non-success HTTP status to the delivery error taxonomy.
pub(crate) fn status_error(channel: &str, status: StatusCode, body: &str) -> Error {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        return Error::ChannelUnavailable(format!("{} returned {}: {}", channel, status, body));
    }
    Error::Validation(format!("{} rejected request with {}: {}", channel, status, body))
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn name(&self) -> String {
        "slack".to_string()
    }

    async fn deliver(&self, message: &AlertMessage) -> Result<()> {
        debug!("Posting alert {} to Slack", message.fingerprint);
        let response = self
            .client
            .post(self.webhook_url.clone())
            .json(&self.payload(message))
            .send()
            .await
            .map_err(|e| Error::ChannelUnavailable(format!("slack: {}", e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error("slack", status, &body))
    }
}
