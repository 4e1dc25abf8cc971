//! Notification capability
//!
//! Services hand a rendered message to a [`Notifier`]; how it reaches the
//! participant (mail relay, log in dry-run mode) is the implementation's
//! concern.

use crate::config::NotifyConfig;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Notification errors
#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Relay rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Notifier not configured: {0}")]
    NotConfigured(String),
}

/// Rendered message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message. `Ok` means the transport accepted it.
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError>;

    fn name(&self) -> &'static str;
}

/// Posts messages as JSON to an HTTP mail relay
pub struct RelayNotifier {
    http_client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    rate_limiter: Option<DefaultDirectRateLimiter>,
}

impl RelayNotifier {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Network(e.to_string()))?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            token,
            rate_limiter: None,
        })
    }

    /// Send at most `max_per_minute` messages per minute; 0 means unlimited.
    /// A full minute's quota may go out as one burst.
    pub fn with_rate_limit(mut self, max_per_minute: u32) -> Self {
        self.rate_limiter =
            NonZeroU32::new(max_per_minute).map(|n| RateLimiter::direct(Quota::per_minute(n)));
        self
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let mut request = self.http_client.post(&self.endpoint).json(message);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}

/// Dry-run notifier: logs what would be sent
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            bytes = message.html.len(),
            "Dry run: message not sent"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Notifier for the configured transport, or the log notifier in dry-run mode
pub fn notifier_from_config(
    config: &NotifyConfig,
    dry_run: bool,
) -> Result<Arc<dyn Notifier>, NotifyError> {
    if dry_run {
        return Ok(Arc::new(LogNotifier));
    }
    let endpoint = config
        .endpoint
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| {
            NotifyError::NotConfigured(
                "no relay endpoint (set [notify] endpoint or RECRUIT_NOTIFY_URL, or use --dry-run)"
                    .into(),
            )
        })?;
    let notifier = RelayNotifier::new(
        endpoint,
        config.token.clone(),
        Duration::from_secs(config.timeout_secs),
    )?
    .with_rate_limit(config.max_per_minute);
    Ok(Arc::new(notifier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_uses_log_notifier() {
        let notifier = notifier_from_config(&NotifyConfig::default(), true).unwrap();
        assert_eq!(notifier.name(), "log");
    }

    #[test]
    fn test_missing_endpoint_is_not_configured() {
        let result = notifier_from_config(&NotifyConfig::default(), false);
        assert!(matches!(result, Err(NotifyError::NotConfigured(_))));
    }

    #[test]
    fn test_message_serializes_without_empty_sender() {
        let message = EmailMessage {
            to: "p@example.org".into(),
            from: None,
            subject: "Hello".into(),
            html: "<p>Hi</p>".into(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["to"], "p@example.org");
        assert!(json.get("from").is_none());
    }
}
