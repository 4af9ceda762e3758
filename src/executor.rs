//! Retrying request execution.
//!
//! Each attempt waits a short randomized delay, picks a proxy, sends the
//! request and classifies the outcome:
//!
//! * transport failure: reported to the monitor and the pool, then retried
//!   after an exponential backoff;
//! * challenge status: solved through the configured [`ClearanceSolver`] and
//!   retried straight away with the clearance header attached;
//! * 2xx: proxy latency is recorded and the response returned;
//! * other 4xx: retried after backoff while attempts remain;
//! * anything else: returned as-is for the caller to interpret.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::config::{duration_millis, duration_secs};
use crate::external_deps::clearance::{ClearanceSolver, ClearanceTask};
use crate::modules::monitor::ErrorMonitor;
use crate::modules::proxy::ProxyPool;
use crate::transport::{HttpResponse, HttpTransport, OutboundRequest, TransportError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("request failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last_error: TransportError,
    },
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per request, including the first.
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(rename = "request_timeout_secs", with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(rename = "rate_limit_min_ms", with = "duration_millis")]
    pub rate_limit_min: Duration,
    #[serde(rename = "rate_limit_max_ms", with = "duration_millis")]
    pub rate_limit_max: Duration,
    pub challenge_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            rate_limit_min: Duration::from_secs(1),
            rate_limit_max: Duration::from_secs(3),
            challenge_statuses: vec![403, 503],
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    pub fn rate_limit_delay(&self) -> Duration {
        let min = self.rate_limit_min.as_millis() as u64;
        let max = self.rate_limit_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    pub fn is_challenge(&self, status: u16) -> bool {
        self.challenge_statuses.contains(&status)
    }
}

/// Sends requests through the proxy pool with bounded retries.
#[derive(Clone)]
pub struct RetryingRequestExecutor {
    transport: Arc<dyn HttpTransport>,
    pool: ProxyPool,
    monitor: ErrorMonitor,
    solver: Option<Arc<dyn ClearanceSolver>>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingRequestExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>, pool: ProxyPool, monitor: ErrorMonitor) -> Self {
        Self {
            transport,
            pool,
            monitor,
            solver: None,
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn ClearanceSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Waits and in-flight sends end early with [`ExecutorError::Cancelled`]
    /// once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn monitor(&self) -> &ErrorMonitor {
        &self.monitor
    }

    pub async fn execute(&self, request: OutboundRequest) -> Result<HttpResponse, ExecutorError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut request = request;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let retries_left = attempt + 1 < max_attempts;

            self.cancellable(sleep(self.policy.rate_limit_delay())).await?;

            let proxy = self.pool.select();
            log::debug!(
                "{} {} attempt {}/{} via {}",
                request.method,
                request.url,
                attempt + 1,
                max_attempts,
                proxy.as_deref().unwrap_or("direct")
            );

            let started = Instant::now();
            let outcome = self
                .cancellable(self.transport.send(
                    &request,
                    proxy.as_deref(),
                    self.policy.request_timeout,
                ))
                .await?;

            let response = match outcome {
                Ok(response) => response,
                Err(err) => {
                    log::warn!(
                        "attempt {}/{} for {} failed: {err}",
                        attempt + 1,
                        max_attempts,
                        request.url
                    );
                    self.record_transport_failure(&request, proxy.as_deref(), &err)
                        .await;
                    last_error = Some(err);
                    if retries_left {
                        self.cancellable(sleep(self.policy.backoff(attempt))).await?;
                    }
                    continue;
                }
            };

            let status = response.status;
            if retries_left
                && self.policy.is_challenge(status)
                && self.solve_challenge(&mut request, status).await?
            {
                continue;
            }

            if response.is_success() {
                if let Some(proxy) = proxy.as_deref() {
                    self.pool.report_success(proxy, started.elapsed());
                }
                return Ok(response);
            }

            if retries_left && (400..500).contains(&status) {
                log::info!(
                    "{} returned {status}, retrying in {:.1}s",
                    request.url,
                    self.policy.backoff(attempt).as_secs_f64()
                );
                self.cancellable(sleep(self.policy.backoff(attempt))).await?;
                continue;
            }

            return Ok(response);
        }

        Err(ExecutorError::ExhaustedRetries {
            attempts: max_attempts,
            last_error: last_error
                .unwrap_or_else(|| TransportError::Request("no attempt was sent".into())),
        })
    }

    async fn record_transport_failure(
        &self,
        request: &OutboundRequest,
        proxy: Option<&str>,
        err: &TransportError,
    ) {
        let message = err.to_string();
        self.monitor
            .report_network_failure(request.url.as_str(), &message, None)
            .await;
        if let Some(proxy) = proxy {
            self.pool.report_failure(proxy);
            self.monitor.report_proxy_failure(proxy, &message).await;
        }
    }

    /// Attaches a clearance token to `request`. `Ok(false)` means no token
    /// was obtained and the response should be handled normally.
    async fn solve_challenge(
        &self,
        request: &mut OutboundRequest,
        status: u16,
    ) -> Result<bool, ExecutorError> {
        let Some(solver) = &self.solver else {
            return Ok(false);
        };

        log::info!("challenge ({status}) from {}, requesting clearance", request.url);
        let task = ClearanceTask::new(request.url.as_str(), status);
        let token = match self.cancellable(solver.solve(&task)).await? {
            Ok(token) => token,
            Err(err) => {
                log::warn!("{} solver failed: {err}", solver.name());
                return Ok(false);
            }
        };

        let header = HeaderName::from_bytes(solver.clearance_header().as_bytes());
        let value = HeaderValue::from_str(&token);
        let (Ok(header), Ok(value)) = (header, value) else {
            log::warn!("clearance token from {} is not a valid header", solver.name());
            return Ok(false);
        };
        request.headers.insert(header, value);
        Ok(true)
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, ExecutorError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExecutorError::Cancelled),
            output = fut => Ok(output),
        }
    }
}
