//! Alert delivery channels.
//!
//! The error monitor hands every alert to each enabled [`AlertSink`]. Channel
//! failures are reported back as [`AlertError`] and never affect the other
//! channels.

mod email;
mod webhook;

pub use email::EmailAlertSink;
pub use webhook::WebhookAlertSink;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::monitor::Alert;

/// A destination for monitor alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert channel misconfigured: {0}")]
    Configuration(String),
    #[error("alert delivery failed: {0}")]
    Delivery(String),
    #[error("alert endpoint returned status {0}")]
    Status(u16),
}

/// SMTP relay credentials and recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
