//! Outbound notification channels.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::ApprovalConfig;
use crate::domain::ApprovalChannel;

/// Delivery outcome of one notification attempt. Delivery is always
/// best-effort; callers log and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered,
    /// Channel not handled by this notifier
    Skipped,
    Failed,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: ApprovalChannel, recipient: &str, message: &str)
        -> NotifyOutcome;
}

/// SMS gateway webhook client
#[derive(Clone)]
pub struct SmsNotifier {
    gateway_url: String,
    client: Client,
}

impl SmsNotifier {
    pub fn new(gateway_url: String) -> Arc<Self> {
        Arc::new(Self {
            gateway_url,
            client: Client::new(),
        })
    }

    /// Create from config; `None` leaves the SMS channel disabled.
    pub fn from_config(config: &ApprovalConfig) -> Option<Arc<Self>> {
        config
            .sms_gateway_url
            .as_ref()
            .filter(|url| !url.is_empty())
            .map(|url| {
                info!("SMS notifications enabled");
                Self::new(url.clone())
            })
    }

    async fn post(&self, to: &str, message: &str) -> Result<(), String> {
        let payload = serde_json::json!({
            "to": to,
            "message": message,
        });

        let response = self
            .client
            .post(&self.gateway_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("Failed to reach SMS gateway: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("SMS gateway returned status {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmsNotifier {
    async fn send(
        &self,
        channel: ApprovalChannel,
        recipient: &str,
        message: &str,
    ) -> NotifyOutcome {
        if channel != ApprovalChannel::Sms {
            return NotifyOutcome::Skipped;
        }
        match self.post(recipient, message).await {
            Ok(()) => {
                debug!("SMS delivered to {}", recipient);
                NotifyOutcome::Delivered
            }
            Err(e) => {
                error!("SMS delivery failed: {}", e);
                NotifyOutcome::Failed
            }
        }
    }
}
