//! Data types shared by the error monitor, its persisted document and the
//! alert sinks.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::duration_secs;
use crate::external_deps::alerts::{EmailSettings, WebhookSettings};

use super::MonitorError;

/// Identifier of a recorded [`ErrorEvent`].
pub type EventId = String;

/// Open key-value bag attached to every event.
pub type EventDetails = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCategory {
    Network,
    Proxy,
    Auth,
    Checkout,
    Payment,
    Parsing,
    Validation,
    Timeout,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Network,
        ErrorCategory::Proxy,
        ErrorCategory::Auth,
        ErrorCategory::Checkout,
        ErrorCategory::Payment,
        ErrorCategory::Parsing,
        ErrorCategory::Validation,
        ErrorCategory::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Proxy => "PROXY",
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::Checkout => "CHECKOUT",
            ErrorCategory::Payment => "PAYMENT",
            ErrorCategory::Parsing => "PARSING",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Timeout => "TIMEOUT",
        }
    }

    /// Events of this category needed before an alert is sent.
    pub fn default_threshold(&self) -> u32 {
        match self {
            ErrorCategory::Network => 5,
            ErrorCategory::Proxy => 3,
            ErrorCategory::Auth => 2,
            ErrorCategory::Checkout => 2,
            ErrorCategory::Payment => 1,
            ErrorCategory::Parsing => 10,
            ErrorCategory::Validation => 5,
            ErrorCategory::Timeout => 3,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = MonitorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| MonitorError::InvalidCategory(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default)]
    pub details: EventDetails,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

impl ErrorEvent {
    pub(crate) fn resolve(&mut self, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(at);
    }
}

/// Per-category gate state: events since the last alert and when it fired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThresholdState {
    pub count_since_alert: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_alert: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub thresholds: BTreeMap<ErrorCategory, u32>,
    #[serde(rename = "cooldown_secs", with = "duration_secs")]
    pub cooldown: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSettings>,
}

impl AlertConfig {
    /// Configured threshold, or the category default when none is set.
    pub fn threshold(&self, category: ErrorCategory) -> u32 {
        self.thresholds
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_threshold())
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: ErrorCategory::ALL
                .into_iter()
                .map(|category| (category, category.default_threshold()))
                .collect(),
            cooldown: Duration::from_secs(300),
            email: None,
            webhook: None,
        }
    }
}

/// Alert handed to every enabled sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub event: ErrorEvent,
    /// Events of this category counted towards the alert.
    pub category_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub total_events: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub events_by_category: BTreeMap<ErrorCategory, usize>,
    pub events_by_severity: BTreeMap<Severity, usize>,
    pub alerts_sent: BTreeMap<ErrorCategory, u64>,
}
