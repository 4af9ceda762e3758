//! Proxy rotation and health tracking.
//!
//! Keeps the outbound proxy endpoints together with their health state and
//! hands one out per request according to the active rotation mode. All
//! state lives behind a single lock per pool; clones of a [`ProxyPool`]
//! share that state.

pub mod health;

pub use health::{HealthCheckHandle, HealthProbe, ProbeError, ReqwestHealthProbe};

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::duration_secs;

pub(crate) const DEFAULT_PROBE_URL: &str = "https://httpbin.org/ip";

/// Policy used by [`ProxyPool::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    RoundRobin,
    Random,
    Weighted,
}

impl RotationMode {
    pub const ALL: [RotationMode; 3] = [
        RotationMode::RoundRobin,
        RotationMode::Random,
        RotationMode::Weighted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RotationMode::RoundRobin => "round_robin",
            RotationMode::Random => "random",
            RotationMode::Weighted => "weighted",
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationMode {
    type Err = ProxyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RotationMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value)
            .ok_or_else(|| ProxyError::InvalidRotationMode(value.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("invalid rotation mode '{0}' (expected round_robin, random or weighted)")]
    InvalidRotationMode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub enabled: bool,
    pub rotation_mode: RotationMode,
    pub health_check: bool,
    #[serde(rename = "health_check_interval_secs", with = "duration_secs")]
    pub health_check_interval: Duration,
    pub max_failures: u32,
    #[serde(rename = "timeout_secs", with = "duration_secs")]
    pub timeout: Duration,
    /// Informational. Carried for callers that pace their own retries through
    /// a proxy; neither selection nor the health check reads it.
    #[serde(rename = "retry_delay_secs", with = "duration_secs")]
    pub retry_delay: Duration,
    /// Fetched through each endpoint by the background health check.
    pub probe_url: String,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rotation_mode: RotationMode::RoundRobin,
            health_check: true,
            health_check_interval: Duration::from_secs(30),
            max_failures: 3,
            timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            probe_url: DEFAULT_PROBE_URL.to_string(),
        }
    }
}

/// Snapshot of a single endpoint's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyEndpoint {
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub latency: Option<Duration>,
}

impl ProxyEndpoint {
    fn new(url: String, weight: u32) -> Self {
        Self {
            url,
            weight,
            healthy: true,
            consecutive_failures: 0,
            last_used: None,
            last_checked: None,
            latency: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub failures_total: u64,
    pub rotation_mode: RotationMode,
    pub enabled: bool,
}

#[derive(Debug)]
pub(crate) struct PoolState {
    config: ProxyPoolConfig,
    endpoints: Vec<ProxyEndpoint>,
    /// Index into `endpoints` where the next round-robin scan starts.
    cursor: usize,
    rng: StdRng,
}

impl PoolState {
    fn healthy_indices(&self) -> Vec<usize> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, endpoint)| endpoint.healthy)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn pick(&mut self) -> Option<usize> {
        match self.config.rotation_mode {
            RotationMode::RoundRobin => self.pick_round_robin(),
            RotationMode::Random => {
                let healthy = self.healthy_indices();
                healthy.choose(&mut self.rng).copied()
            }
            RotationMode::Weighted => {
                let healthy = self.healthy_indices();
                weighted_choice_index(&mut self.rng, &self.endpoints, &healthy)
            }
        }
    }

    // Walks the full list from the cursor, so endpoints that flip health
    // between calls never shift the position of the others.
    fn pick_round_robin(&mut self) -> Option<usize> {
        let len = self.endpoints.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor % len;
        let idx = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| self.endpoints[idx].healthy)?;
        self.cursor = (idx + 1) % len;
        Some(idx)
    }

    fn find_mut(&mut self, url: &str) -> Option<&mut ProxyEndpoint> {
        self.endpoints.iter_mut().find(|endpoint| endpoint.url == url)
    }
}

/// Shared proxy pool with health tracking and rotation policies.
#[derive(Clone, Debug)]
pub struct ProxyPool {
    inner: Arc<RwLock<PoolState>>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Pool with a deterministic random source for the random and weighted modes.
    pub fn with_seed(config: ProxyPoolConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ProxyPoolConfig, rng: StdRng) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PoolState {
                config,
                endpoints: Vec::new(),
                cursor: 0,
                rng,
            })),
        }
    }

    pub(crate) fn from_shared(inner: Arc<RwLock<PoolState>>) -> Self {
        Self { inner }
    }

    pub(crate) fn shared(&self) -> &Arc<RwLock<PoolState>> {
        &self.inner
    }

    /// Appends a healthy endpoint. Duplicates are kept as separate entries.
    pub fn add(&self, url: impl Into<String>, weight: u32) {
        let url = url.into();
        log::info!("added proxy {url} (weight {weight})");
        let mut guard = self.inner.write().expect("proxy pool lock poisoned");
        guard.endpoints.push(ProxyEndpoint::new(url, weight));
    }

    pub fn add_many<I>(&self, urls: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for url in urls {
            self.add(url, 1);
        }
    }

    pub fn enable(&self) {
        self.inner.write().expect("proxy pool lock poisoned").config.enabled = true;
        log::info!("proxy pool enabled");
    }

    pub fn disable(&self) {
        self.inner.write().expect("proxy pool lock poisoned").config.enabled = false;
        log::info!("proxy pool disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().expect("proxy pool lock poisoned").config.enabled
    }

    /// Parses and applies a rotation mode name (`round_robin`, `random`, `weighted`).
    pub fn set_rotation_mode(&self, mode: &str) -> Result<(), ProxyError> {
        let mode = mode.parse::<RotationMode>()?;
        self.set_rotation(mode);
        Ok(())
    }

    pub fn set_rotation(&self, mode: RotationMode) {
        self.inner
            .write()
            .expect("proxy pool lock poisoned")
            .config
            .rotation_mode = mode;
        log::info!("proxy rotation mode set to {mode}");
    }

    pub fn set_max_failures(&self, max_failures: u32) {
        self.inner
            .write()
            .expect("proxy pool lock poisoned")
            .config
            .max_failures = max_failures.max(1);
    }

    pub fn config(&self) -> ProxyPoolConfig {
        self.inner.read().expect("proxy pool lock poisoned").config.clone()
    }

    /// Returns the next healthy endpoint, or `None` when the pool is disabled,
    /// empty, or has nothing healthy left.
    pub fn select(&self) -> Option<String> {
        let mut guard = self.inner.write().expect("proxy pool lock poisoned");
        if !guard.config.enabled || guard.endpoints.is_empty() {
            return None;
        }

        let chosen = guard
            .pick()
            .filter(|&idx| guard.endpoints[idx].healthy)
            .or_else(|| guard.endpoints.iter().position(|endpoint| endpoint.healthy));

        match chosen {
            Some(idx) => {
                let endpoint = &mut guard.endpoints[idx];
                endpoint.last_used = Some(Utc::now());
                log::debug!("selected proxy {}", endpoint.url);
                Some(endpoint.url.clone())
            }
            None => {
                log::warn!("no healthy proxies available");
                None
            }
        }
    }

    /// Counts a failure against `url`; unknown endpoints are ignored.
    pub fn report_failure(&self, url: &str) {
        let mut guard = self.inner.write().expect("proxy pool lock poisoned");
        let max_failures = guard.config.max_failures;
        let Some(endpoint) = guard.find_mut(url) else {
            return;
        };

        endpoint.consecutive_failures = endpoint.consecutive_failures.saturating_add(1);
        endpoint.last_checked = Some(Utc::now());
        if endpoint.consecutive_failures >= max_failures {
            if endpoint.healthy {
                log::warn!(
                    "proxy {url} marked unhealthy after {} failures",
                    endpoint.consecutive_failures
                );
            }
            endpoint.healthy = false;
        } else {
            log::warn!(
                "proxy failure {}/{max_failures}: {url}",
                endpoint.consecutive_failures
            );
        }
    }

    pub fn report_success(&self, url: &str, latency: Duration) {
        let mut guard = self.inner.write().expect("proxy pool lock poisoned");
        if let Some(endpoint) = guard.find_mut(url) {
            endpoint.healthy = true;
            endpoint.consecutive_failures = 0;
            endpoint.last_checked = Some(Utc::now());
            endpoint.latency = Some(latency);
            log::debug!("proxy {url} healthy ({:.2}s)", latency.as_secs_f64());
        }
    }

    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.inner
            .read()
            .expect("proxy pool lock poisoned")
            .endpoints
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("proxy pool lock poisoned").endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let guard = self.inner.read().expect("proxy pool lock poisoned");
        let total = guard.endpoints.len();
        let healthy = guard.endpoints.iter().filter(|e| e.healthy).count();
        let failures_total = guard
            .endpoints
            .iter()
            .map(|e| u64::from(e.consecutive_failures))
            .sum();

        ProxyPoolStats {
            total,
            healthy,
            unhealthy: total - healthy,
            failures_total,
            rotation_mode: guard.config.rotation_mode,
            enabled: guard.config.enabled,
        }
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(ProxyPoolConfig::default())
    }
}

// Falls back to a uniform pick when every candidate has weight 0.
fn weighted_choice_index(
    rng: &mut StdRng,
    endpoints: &[ProxyEndpoint],
    indices: &[usize],
) -> Option<usize> {
    if indices.is_empty() {
        return None;
    }

    let total: u64 = indices
        .iter()
        .map(|&idx| u64::from(endpoints[idx].weight))
        .sum();
    if total == 0 {
        return indices.choose(rng).copied();
    }

    let mut target = rng.gen_range(0..total);
    for &idx in indices {
        let weight = u64::from(endpoints[idx].weight);
        if target < weight {
            return Some(idx);
        }
        target -= weight;
    }

    indices.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn enabled_pool(mode: RotationMode) -> ProxyPool {
        ProxyPool::with_seed(
            ProxyPoolConfig {
                enabled: true,
                rotation_mode: mode,
                ..Default::default()
            },
            7,
        )
    }

    #[test]
    fn round_robin_visits_every_endpoint_once_per_cycle() {
        for n in 1..=6 {
            for warmup in 0..n {
                let pool = enabled_pool(RotationMode::RoundRobin);
                for i in 0..n {
                    pool.add(format!("http://10.0.0.{i}:8080"), 1);
                }
                for _ in 0..warmup {
                    pool.select();
                }
                let seen: HashSet<String> = (0..n).filter_map(|_| pool.select()).collect();
                assert_eq!(seen.len(), n, "n={n} warmup={warmup}");
            }
        }
    }

    #[test]
    fn round_robin_skips_unhealthy_without_repeating() {
        let pool = enabled_pool(RotationMode::RoundRobin);
        pool.add_many(["http://a:1", "http://b:1", "http://c:1"]);
        pool.set_max_failures(1);

        assert_eq!(pool.select().as_deref(), Some("http://a:1"));
        pool.report_failure("http://b:1");
        assert_eq!(pool.select().as_deref(), Some("http://c:1"));
        assert_eq!(pool.select().as_deref(), Some("http://a:1"));

        pool.report_success("http://b:1", Duration::from_millis(40));
        assert_eq!(pool.select().as_deref(), Some("http://b:1"));
        assert_eq!(pool.select().as_deref(), Some("http://c:1"));
    }

    #[test]
    fn failure_threshold_and_recovery() {
        let pool = enabled_pool(RotationMode::RoundRobin);
        pool.add("http://1.1.1.1:8080", 1);

        pool.report_failure("http://1.1.1.1:8080");
        pool.report_failure("http://1.1.1.1:8080");
        assert_eq!(pool.stats().healthy, 1);

        pool.report_failure("http://1.1.1.1:8080");
        let stats = pool.stats();
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.failures_total, 3);
        assert_eq!(pool.select(), None);

        pool.report_success("http://1.1.1.1:8080", Duration::from_millis(120));
        let endpoint = &pool.endpoints()[0];
        assert!(endpoint.healthy);
        assert_eq!(endpoint.consecutive_failures, 0);
        assert_eq!(endpoint.latency, Some(Duration::from_millis(120)));
        assert!(endpoint.last_checked.is_some());
    }

    #[test]
    fn disabled_pool_never_selects() {
        let pool = ProxyPool::default();
        pool.add_many(["http://a:1", "http://b:1"]);
        for _ in 0..10 {
            assert_eq!(pool.select(), None);
        }
        pool.enable();
        assert!(pool.select().is_some());
        pool.disable();
        assert_eq!(pool.select(), None);
    }

    #[test]
    fn empty_or_all_unhealthy_returns_none() {
        let pool = enabled_pool(RotationMode::Random);
        assert_eq!(pool.select(), None);

        pool.add("http://a:1", 1);
        pool.set_max_failures(1);
        pool.report_failure("http://a:1");
        assert_eq!(pool.select(), None);
    }

    #[test]
    fn unknown_url_reports_are_ignored() {
        let pool = enabled_pool(RotationMode::RoundRobin);
        pool.add("http://a:1", 1);
        pool.report_failure("http://missing:1");
        pool.report_success("http://missing:1", Duration::from_millis(5));
        assert_eq!(pool.stats().failures_total, 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rejects_unknown_rotation_mode() {
        let pool = ProxyPool::default();
        assert_eq!(
            pool.set_rotation_mode("sticky"),
            Err(ProxyError::InvalidRotationMode("sticky".into()))
        );
        pool.set_rotation_mode("weighted").unwrap();
        assert_eq!(pool.stats().rotation_mode, RotationMode::Weighted);
    }

    #[test]
    fn weighted_selection_tracks_weights() {
        let pool = enabled_pool(RotationMode::Weighted);
        pool.add("http://heavy:1", 3);
        pool.add("http://light:1", 1);

        let draws = 100_000;
        let heavy = (0..draws)
            .filter(|_| pool.select().as_deref() == Some("http://heavy:1"))
            .count();
        let share = heavy as f64 / draws as f64;
        assert!((share - 0.75).abs() < 0.02, "heavy share {share}");
    }

    #[test]
    fn zero_weights_fall_back_to_random() {
        let pool = enabled_pool(RotationMode::Weighted);
        pool.add("http://a:1", 0);
        pool.add("http://b:1", 0);
        let seen: HashSet<String> = (0..200).filter_map(|_| pool.select()).collect();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn select_marks_last_used() {
        let pool = enabled_pool(RotationMode::RoundRobin);
        pool.add("http://a:1", 1);
        assert!(pool.endpoints()[0].last_used.is_none());
        pool.select();
        assert!(pool.endpoints()[0].last_used.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_keep_per_endpoint_counts() {
        let pool = enabled_pool(RotationMode::RoundRobin);
        let urls: Vec<String> = (0..8).map(|i| format!("http://10.0.1.{i}:8080")).collect();
        pool.add_many(urls.clone());
        pool.set_max_failures(500);

        let mut tasks = tokio::task::JoinSet::new();
        for (i, url) in urls.iter().cloned().enumerate() {
            let pool = pool.clone();
            tasks.spawn(async move {
                for round in 0..1000 {
                    // Even endpoints recover every tenth round and stay selectable.
                    assert!(pool.select().is_some());
                    pool.report_failure(&url);
                    if i % 2 == 0 && round % 10 == 9 {
                        pool.report_success(&url, Duration::from_millis(5));
                    }
                    tokio::task::yield_now().await;
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        for (i, endpoint) in pool.endpoints().iter().enumerate() {
            assert_eq!(endpoint.url, urls[i]);
            if i % 2 == 0 {
                assert_eq!(endpoint.consecutive_failures, 0, "{}", endpoint.url);
                assert!(endpoint.healthy, "{}", endpoint.url);
                assert_eq!(endpoint.latency, Some(Duration::from_millis(5)));
            } else {
                assert_eq!(endpoint.consecutive_failures, 1000, "{}", endpoint.url);
                assert!(!endpoint.healthy, "{}", endpoint.url);
            }
        }

        let stats = pool.stats();
        assert_eq!(stats.healthy, 4);
        assert_eq!(stats.unhealthy, 4);
        assert_eq!(stats.failures_total, 4000);
    }
}
