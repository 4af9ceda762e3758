//! Error event log with threshold/cooldown-gated alerting.
//!
//! Every reported failure is appended to an ordered log and counted against
//! its category. Once a category's count reaches its threshold, and the
//! category's cooldown has elapsed since its previous alert, the count is
//! reset and an alert goes out through every enabled sink. Gate evaluation
//! happens under the monitor's lock; delivery happens after it is released.

mod persistence;
pub mod types;

pub use types::{
    Alert, AlertConfig, AlertThresholdState, ErrorCategory, ErrorEvent, EventDetails, EventId,
    MonitorStats, Severity,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::timeout;

use crate::config::MonitorSettings;
use crate::external_deps::alerts::{
    AlertSink, EmailAlertSink, EmailSettings, WebhookAlertSink, WebhookSettings,
};

use persistence::MonitorDocument;

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("error event not found: {0}")]
    NotFound(EventId),
    #[error("error event already resolved: {0}")]
    AlreadyResolved(EventId),
    #[error("unknown error category '{0}'")]
    InvalidCategory(String),
    #[error("monitor state io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("monitor state (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

struct MonitorState {
    events: Vec<ErrorEvent>,
    thresholds: BTreeMap<ErrorCategory, AlertThresholdState>,
    alerts_sent: BTreeMap<ErrorCategory, u64>,
    config: AlertConfig,
    extra_sinks: Vec<Arc<dyn AlertSink>>,
}

impl MonitorState {
    fn new(config: AlertConfig) -> Self {
        Self {
            events: Vec::new(),
            thresholds: BTreeMap::new(),
            alerts_sent: BTreeMap::new(),
            config,
            extra_sinks: Vec::new(),
        }
    }

    /// Appends the event and applies the alert gate. Returns the alert to
    /// deliver when the gate opened; the category count is already reset.
    fn record(&mut self, event: ErrorEvent, now: DateTime<Utc>) -> Option<Alert> {
        let category = event.category;
        self.events.push(event);

        let threshold = self.config.threshold(category);
        let cooldown = chrono_duration(self.config.cooldown);
        let enabled = self.config.enabled;
        let gate = self.thresholds.entry(category).or_default();
        gate.count_since_alert = gate.count_since_alert.saturating_add(1);

        if !enabled || gate.count_since_alert < threshold {
            return None;
        }
        if let Some(last) = gate.last_alert
            && now.signed_duration_since(last) < cooldown
        {
            return None;
        }

        let category_count = gate.count_since_alert;
        gate.count_since_alert = 0;
        gate.last_alert = Some(now);
        *self.alerts_sent.entry(category).or_default() += 1;

        self.events.last().map(|event| Alert {
            event: event.clone(),
            category_count,
        })
    }

    fn sinks(&self) -> Vec<Arc<dyn AlertSink>> {
        let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
        if let Some(settings) = &self.config.email {
            sinks.push(Arc::new(EmailAlertSink::new(settings.clone())));
        }
        if let Some(settings) = &self.config.webhook {
            sinks.push(Arc::new(WebhookAlertSink::new(settings.clone())));
        }
        sinks.extend(self.extra_sinks.iter().cloned());
        sinks
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ErrorEvent> {
        self.events.iter_mut().find(|event| event.id == id)
    }

    fn document(&self) -> MonitorDocument {
        MonitorDocument {
            events: self.events.clone(),
            thresholds: self.thresholds.clone(),
            alerts_sent: self.alerts_sent.clone(),
            config: self.config.clone(),
        }
    }

    fn restore(&mut self, document: MonitorDocument) {
        self.events = document.events;
        self.thresholds = document.thresholds;
        self.alerts_sent = document.alerts_sent;
        self.config = document.config;
    }
}

/// Shared error monitor. Clones share the same event log.
#[derive(Clone)]
pub struct ErrorMonitor {
    inner: Arc<RwLock<MonitorState>>,
    state_file: PathBuf,
    auto_resolve_after: Duration,
    delivery_timeout: Duration,
}

impl ErrorMonitor {
    pub fn new(config: AlertConfig) -> Self {
        Self::with_settings(config, &MonitorSettings::default())
    }

    pub fn with_settings(config: AlertConfig, settings: &MonitorSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MonitorState::new(config))),
            state_file: settings.state_file.clone(),
            auto_resolve_after: settings.auto_resolve_after,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Upper bound for a single channel's delivery attempt.
    pub fn with_delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Records an event and delivers an alert if its category's gate opens.
    ///
    /// Never fails: delivery problems are logged. INFO events are resolved
    /// automatically after the configured delay unless resolved earlier.
    pub async fn report(
        &self,
        category: ErrorCategory,
        severity: Severity,
        message: impl Into<String>,
        details: EventDetails,
    ) -> EventId {
        self.report_at(category, severity, message.into(), details, Utc::now())
            .await
    }

    async fn report_at(
        &self,
        category: ErrorCategory,
        severity: Severity,
        message: String,
        details: EventDetails,
        now: DateTime<Utc>,
    ) -> EventId {
        log::warn!("error reported [{category}]: {message}");

        let (id, pending) = {
            let mut guard = self.inner.write().expect("error monitor lock poisoned");
            let id = format!("err_{}_{}", now.timestamp(), guard.events.len());
            let event = ErrorEvent {
                id: id.clone(),
                timestamp: now,
                severity,
                category,
                message,
                details,
                resolved: false,
                resolved_at: None,
                retry_count: 0,
            };
            let alert = guard.record(event, now);
            let pending = alert.map(|alert| (alert, guard.sinks()));
            (id, pending)
        };

        if let Some((alert, sinks)) = pending {
            self.deliver(alert, sinks).await;
        }

        if severity == Severity::Info {
            self.schedule_auto_resolve(id.clone(), self.auto_resolve_after);
        }

        id
    }

    async fn deliver(&self, alert: Alert, sinks: Vec<Arc<dyn AlertSink>>) {
        log::info!(
            "sending alert for {} error: {}",
            alert.event.category,
            alert.event.message
        );
        if sinks.is_empty() {
            log::debug!("no alert channels configured");
        }

        for sink in sinks {
            match timeout(self.delivery_timeout, sink.deliver(&alert)).await {
                Ok(Ok(())) => log::info!("{} alert sent for {}", sink.name(), alert.event.id),
                Ok(Err(err)) => log::warn!("{} alert failed: {err}", sink.name()),
                Err(_) => log::warn!(
                    "{} alert timed out after {:.1}s",
                    sink.name(),
                    self.delivery_timeout.as_secs_f64()
                ),
            }
        }
    }

    fn schedule_auto_resolve(&self, id: EventId, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::debug!("no tokio runtime, {id} will not auto-resolve");
            return;
        };
        let monitor = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = monitor.inner.write().expect("error monitor lock poisoned");
            if let Some(event) = guard.find_mut(&id)
                && !event.resolved
            {
                event.resolve(Utc::now());
                log::info!("auto-resolved error {id}");
            }
        });
    }

    pub fn resolve(&self, id: &str) -> Result<(), MonitorError> {
        let mut guard = self.inner.write().expect("error monitor lock poisoned");
        let event = guard
            .find_mut(id)
            .ok_or_else(|| MonitorError::NotFound(id.to_string()))?;
        if event.resolved {
            return Err(MonitorError::AlreadyResolved(id.to_string()));
        }
        event.resolve(Utc::now());
        log::info!("resolved error {id}");
        Ok(())
    }

    pub async fn report_checkout_failure(
        &self,
        product_url: &str,
        message: &str,
        error_code: &str,
        retry_count: u32,
    ) -> EventId {
        let details = details([
            ("product_url", json!(product_url)),
            ("error_code", json!(error_code)),
            ("retry_count", json!(retry_count)),
            ("stage", json!("checkout")),
        ]);
        self.report(
            ErrorCategory::Checkout,
            Severity::Error,
            format!("Checkout failed: {message}"),
            details,
        )
        .await
    }

    pub async fn report_payment_failure(
        &self,
        card_last4: &str,
        message: &str,
        decline_reason: &str,
    ) -> EventId {
        let details = details([
            ("card_last4", json!(card_last4)),
            ("decline_reason", json!(decline_reason)),
            ("stage", json!("payment")),
        ]);
        self.report(
            ErrorCategory::Payment,
            Severity::Critical,
            format!("Payment failed: {message}"),
            details,
        )
        .await
    }

    pub async fn report_proxy_failure(&self, proxy: &str, message: &str) -> EventId {
        let details = details([("proxy_url", json!(proxy)), ("stage", json!("proxy"))]);
        self.report(
            ErrorCategory::Proxy,
            Severity::Warning,
            format!("Proxy failed: {message}"),
            details,
        )
        .await
    }

    /// `status` is `None` when no response was received.
    pub async fn report_network_failure(
        &self,
        url: &str,
        message: &str,
        status: Option<u16>,
    ) -> EventId {
        let details = details([
            ("url", json!(url)),
            ("status_code", json!(status.unwrap_or(0))),
            ("stage", json!("network")),
        ]);
        self.report(
            ErrorCategory::Network,
            Severity::Warning,
            format!("Network error: {message}"),
            details,
        )
        .await
    }

    pub async fn report_parsing_failure(
        &self,
        source_url: &str,
        field: &str,
        message: &str,
    ) -> EventId {
        let details = details([
            ("url", json!(source_url)),
            ("field", json!(field)),
            ("stage", json!("parsing")),
        ]);
        self.report(
            ErrorCategory::Parsing,
            Severity::Error,
            format!("Parsing failed: {message}"),
            details,
        )
        .await
    }

    pub async fn report_validation_failure(
        &self,
        field: &str,
        value: &str,
        message: &str,
    ) -> EventId {
        let details = details([
            ("field", json!(field)),
            ("value", json!(value)),
            ("stage", json!("validation")),
        ]);
        self.report(
            ErrorCategory::Validation,
            Severity::Warning,
            format!("Validation failed: {message}"),
            details,
        )
        .await
    }

    pub fn configure_email(
        &self,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
    ) {
        let settings = EmailSettings {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            from: from.into(),
            to,
        };
        log::info!("email alerting configured for {:?}", settings.to);
        self.inner
            .write()
            .expect("error monitor lock poisoned")
            .config
            .email = Some(settings);
    }

    pub fn configure_webhook(
        &self,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) {
        let settings = WebhookSettings {
            url: url.into(),
            headers,
        };
        log::info!("webhook alerting configured: {}", settings.url);
        self.inner
            .write()
            .expect("error monitor lock poisoned")
            .config
            .webhook = Some(settings);
    }

    /// Adds a sink that receives every alert alongside the configured channels.
    pub fn register_sink(&self, sink: Arc<dyn AlertSink>) {
        self.inner
            .write()
            .expect("error monitor lock poisoned")
            .extra_sinks
            .push(sink);
    }

    /// Zero means alert on the first occurrence.
    pub fn set_threshold(&self, category: ErrorCategory, threshold: u32) {
        self.inner
            .write()
            .expect("error monitor lock poisoned")
            .config
            .thresholds
            .insert(category, threshold);
        log::info!("error threshold for {category} set to {threshold}");
    }

    pub fn set_threshold_by_name(
        &self,
        category: &str,
        threshold: u32,
    ) -> Result<(), MonitorError> {
        let category = category.parse::<ErrorCategory>()?;
        self.set_threshold(category, threshold);
        Ok(())
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        self.inner
            .write()
            .expect("error monitor lock poisoned")
            .config
            .cooldown = cooldown;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner
            .write()
            .expect("error monitor lock poisoned")
            .config
            .enabled = enabled;
    }

    /// Replaces the alert configuration. Registered sinks are kept.
    pub fn set_config(&self, config: AlertConfig) {
        self.inner.write().expect("error monitor lock poisoned").config = config;
    }

    pub fn config(&self) -> AlertConfig {
        self.inner
            .read()
            .expect("error monitor lock poisoned")
            .config
            .clone()
    }

    pub fn events(&self) -> Vec<ErrorEvent> {
        self.inner
            .read()
            .expect("error monitor lock poisoned")
            .events
            .clone()
    }

    pub fn event(&self, id: &str) -> Option<ErrorEvent> {
        self.inner
            .read()
            .expect("error monitor lock poisoned")
            .events
            .iter()
            .find(|event| event.id == id)
            .cloned()
    }

    pub fn threshold_state(&self, category: ErrorCategory) -> AlertThresholdState {
        self.inner
            .read()
            .expect("error monitor lock poisoned")
            .thresholds
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MonitorStats {
        let guard = self.inner.read().expect("error monitor lock poisoned");
        let mut stats = MonitorStats {
            total_events: guard.events.len(),
            alerts_sent: guard.alerts_sent.clone(),
            ..Default::default()
        };
        for event in &guard.events {
            if event.resolved {
                stats.resolved += 1;
            } else {
                stats.unresolved += 1;
            }
            *stats.events_by_category.entry(event.category).or_default() += 1;
            *stats.events_by_severity.entry(event.severity).or_default() += 1;
        }
        stats
    }

    /// Writes the full monitor state to the configured state file.
    pub fn persist(&self) -> Result<(), MonitorError> {
        self.persist_to(&self.state_file)
    }

    pub fn persist_to(&self, path: &Path) -> Result<(), MonitorError> {
        let document = self
            .inner
            .read()
            .expect("error monitor lock poisoned")
            .document();
        document.write(path)?;
        log::info!("error monitor state saved to {}", path.display());
        Ok(())
    }

    /// Restores state from the configured state file. A missing file leaves
    /// the monitor untouched.
    pub fn load(&self) -> Result<(), MonitorError> {
        self.load_from(&self.state_file)
    }

    pub fn load_from(&self, path: &Path) -> Result<(), MonitorError> {
        let Some(document) = MonitorDocument::read(path)? else {
            log::info!("no error monitor state at {}, starting fresh", path.display());
            return Ok(());
        };
        let pending: Vec<(EventId, DateTime<Utc>)> = {
            let mut guard = self.inner.write().expect("error monitor lock poisoned");
            guard.restore(document);
            guard
                .events
                .iter()
                .filter(|event| event.severity == Severity::Info && !event.resolved)
                .map(|event| (event.id.clone(), event.timestamp))
                .collect()
        };
        log::info!("error monitor state loaded from {}", path.display());

        // Restored INFO events keep whatever is left of their original delay.
        let now = Utc::now();
        for (id, timestamp) in pending {
            let age = now.signed_duration_since(timestamp).to_std().unwrap_or_default();
            self.schedule_auto_resolve(id, self.auto_resolve_after.saturating_sub(age));
        }
        Ok(())
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

impl std::fmt::Debug for ErrorMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorMonitor")
            .field("state_file", &self.state_file)
            .field("auto_resolve_after", &self.auto_resolve_after)
            .finish_non_exhaustive()
    }
}

fn details<const N: usize>(pairs: [(&str, Value); N]) -> EventDetails {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
