//! Best-effort outbound notifications for guardian events and reconciliation
//! anomalies (6. "Notifications (outbound)").
//!
//! Grounded on the teacher's [`crate::adapters::FeishuNotifier`]: a thin
//! webhook POST client, failures logged and swallowed rather than propagated.
//! Unlike the teacher's Feishu-specific client this one is a generic webhook
//! sink, since the spec's notification config is per-user
//! (`GlobalSettings::notification_webhook_url`) rather than one process-wide
//! Feishu URL.

use reqwest::Client;
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn kill_switch_latched(reason: &str) -> Self {
        Self {
            level: AlertLevel::Critical,
            title: "kill switch latched".to_string(),
            message: reason.to_string(),
        }
    }

    pub fn balance_low(total: rust_decimal::Decimal, threshold: rust_decimal::Decimal) -> Self {
        Self {
            level: AlertLevel::Critical,
            title: "balance below threshold".to_string(),
            message: format!("total {total} < threshold {threshold}"),
        }
    }

    pub fn reconciliation_anomaly(message: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Warning,
            title: "reconciliation anomaly".to_string(),
            message: message.into(),
        }
    }

    pub fn orphaned_order(
        market_id: &str,
        account_id: uuid::Uuid,
        side: crate::domain::MarketSide,
        quantity: u64,
        avg_price: rust_decimal::Decimal,
    ) -> Self {
        Self {
            level: AlertLevel::Critical,
            title: "orphaned on-exchange position".to_string(),
            message: format!(
                "{side:?} x{quantity} @ {avg_price} for market {market_id} on account {account_id} has no local record; operator review required before adoption"
            ),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    level: AlertLevel,
    title: &'a str,
    message: &'a str,
}

/// Fires a notification at a per-user webhook URL. Never returns an error to
/// the caller — a notification failure must not block the engine (6).
pub struct Notifier {
    http: Client,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub async fn notify(&self, webhook_url: Option<&str>, notification: &Notification) {
        let Some(url) = webhook_url else {
            warn!(
                title = %notification.title,
                message = %notification.message,
                "no notification webhook configured, logging only"
            );
            return;
        };

        let payload = WebhookPayload {
            level: notification.level,
            title: &notification.title,
            message: &notification.message,
        };

        match self.http.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                error!(status = %resp.status(), title = %notification.title, "notification webhook returned non-success");
            }
            Err(e) => {
                error!(error = %e, title = %notification.title, "notification webhook request failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_notification_is_critical() {
        let n = Notification::kill_switch_latched("balance 95 below threshold 100");
        assert_eq!(n.level, AlertLevel::Critical);
    }

    #[test]
    fn reconciliation_anomaly_is_warning() {
        let n = Notification::reconciliation_anomaly("3 positions closed as not found on exchange");
        assert_eq!(n.level, AlertLevel::Warning);
    }

    #[tokio::test]
    async fn notify_without_webhook_does_not_panic() {
        let notifier = Notifier::new();
        notifier
            .notify(None, &Notification::kill_switch_latched("test"))
            .await;
    }
}
