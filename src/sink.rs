use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::DeliveryError;
use crate::lead::Lead;

/// Forwards leads to the outbound automation webhook.
///
/// Fire-and-forget: one POST per lead with a bounded timeout, no retries.
#[derive(Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn deliver(&self, lead: &Lead) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(lead)?;

        debug!("Sending lead {} to webhook", lead.message_id);

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status { status, body });
        }

        Ok(())
    }
}
