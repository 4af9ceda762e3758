use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{AlertError, AlertSink, WebhookSettings};
use crate::modules::monitor::Alert;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts alerts as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    settings: WebhookSettings,
}

impl WebhookAlertSink {
    pub fn new(settings: WebhookSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|err| AlertError::Configuration(err.to_string()))?;

        let mut request = client.post(&self.settings.url).json(&payload(alert));
        for (name, value) in &self.settings.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| AlertError::Delivery(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }
        Ok(())
    }
}

pub(crate) fn payload(alert: &Alert) -> Value {
    let event = &alert.event;
    json!({
        "alert_type": "error",
        "event_id": event.id,
        "timestamp": event.timestamp.to_rfc3339(),
        "error_type": event.category,
        "level": event.severity,
        "message": event.message,
        "details": event.details,
        "count": alert.category_count,
    })
}
