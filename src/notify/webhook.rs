// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! HTTP webhook notifier

use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::Notifier;
use crate::config::NotifierConfig;
use crate::delivery::QueuedMessage;
use crate::error::{PipelineError, Result};

/// POSTs each message as JSON
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> anyhow::Result<Self> {
        if config.webhook_url.is_empty() {
            anyhow::bail!("webhook notifier needs webhook_url");
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: config.webhook_url.clone(),
            token: config.webhook_token.clone(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &QueuedMessage) -> Result<()> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::DeliveryFailure(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::DeliveryFailure(format!("webhook returned {}", status)));
        }

        debug!(message_id = %message.id, "Webhook delivered ({})", status);
        Ok(())
    }
}
