//! Background health probing for proxy endpoints.
//!
//! Every tick the prober snapshots the endpoint list, fires one probe per
//! endpoint concurrently, and feeds each outcome back through
//! [`ProxyPool::report_success`] / [`ProxyPool::report_failure`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::ProxyPool;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid proxy url '{0}'")]
    InvalidProxy(String),
    #[error("probe request failed: {0}")]
    Transport(String),
    #[error("probe returned status {0}")]
    Status(u16),
}

/// Issues one lightweight request through a proxy and reports the round trip.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, proxy: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Probe that fetches a fixed URL through the proxy and expects a 200.
pub struct ReqwestHealthProbe {
    target: String,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ReqwestHealthProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: &str) -> Result<reqwest::Client, ProbeError> {
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(proxy) {
            return Ok(client.clone());
        }

        let proxy_cfg = reqwest::Proxy::all(proxy)
            .map_err(|_| ProbeError::InvalidProxy(proxy.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy_cfg)
            .build()
            .map_err(|err| ProbeError::Transport(err.to_string()))?;
        guard.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HealthProbe for ReqwestHealthProbe {
    async fn probe(&self, proxy: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        let client = self.client(proxy).await?;
        let started = Instant::now();
        let response = client
            .get(&self.target)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))?;
        let latency = started.elapsed();

        match response.status().as_u16() {
            200 => Ok(latency),
            status => Err(ProbeError::Status(status)),
        }
    }
}

/// Running health-check task. Dropping the handle leaves the task running
/// until the pool itself is dropped; call [`HealthCheckHandle::stop`] to end it.
#[derive(Debug)]
pub struct HealthCheckHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthCheckHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the loop and waits for in-flight probes to settle.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            log::warn!("health check task ended abnormally: {err}");
        }
    }
}

impl ProxyPool {
    /// Starts periodic probing with the default reqwest probe.
    ///
    /// Returns `None` when health checking is disabled in the pool config.
    pub fn start_health_check(&self) -> Option<HealthCheckHandle> {
        let target = self.config().probe_url;
        self.start_health_check_with(Arc::new(ReqwestHealthProbe::new(target)))
    }

    pub fn start_health_check_with(
        &self,
        probe: Arc<dyn HealthProbe>,
    ) -> Option<HealthCheckHandle> {
        let config = self.config();
        if !config.health_check {
            return None;
        }

        let token = CancellationToken::new();
        let state = Arc::downgrade(self.shared());
        let task = tokio::spawn(run_health_checks(
            state,
            probe,
            config.health_check_interval,
            config.timeout,
            token.clone(),
        ));
        log::info!(
            "proxy health check started (every {}s)",
            config.health_check_interval.as_secs_f64()
        );

        Some(HealthCheckHandle { token, task })
    }
}

async fn run_health_checks(
    state: Weak<std::sync::RwLock<super::PoolState>>,
    probe: Arc<dyn HealthProbe>,
    period: Duration,
    timeout: Duration,
    token: CancellationToken,
) {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(shared) = state.upgrade() else {
            break;
        };
        let pool = ProxyPool::from_shared(shared);
        let urls: Vec<String> = pool.endpoints().into_iter().map(|e| e.url).collect();

        let mut probes = JoinSet::new();
        for url in urls {
            let pool = pool.clone();
            let probe = probe.clone();
            probes.spawn(async move {
                match probe.probe(&url, timeout).await {
                    Ok(latency) => pool.report_success(&url, latency),
                    Err(err) => {
                        log::debug!("health probe for {url} failed: {err}");
                        pool.report_failure(&url);
                    }
                }
            });
        }
        drop(pool);

        // Dropping the set aborts probes still in flight.
        tokio::select! {
            _ = token.cancelled() => break,
            _ = async { while probes.join_next().await.is_some() {} } => {}
        }
    }

    log::info!("proxy health check stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::ProxyPoolConfig;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct ScriptedProbe {
        failing: HashSet<String>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, proxy: &str, _timeout: Duration) -> Result<Duration, ProbeError> {
            self.calls.lock().unwrap().push(proxy.to_string());
            if self.failing.contains(proxy) {
                Err(ProbeError::Status(502))
            } else {
                Ok(Duration::from_millis(25))
            }
        }
    }

    fn pool(health_check: bool) -> ProxyPool {
        let pool = ProxyPool::new(ProxyPoolConfig {
            enabled: true,
            health_check,
            health_check_interval: Duration::from_secs(30),
            max_failures: 2,
            ..Default::default()
        });
        pool.add_many(["http://good:1", "http://bad:1"]);
        pool
    }

    #[tokio::test]
    async fn disabled_health_check_is_noop() {
        let pool = pool(false);
        let probe = Arc::new(ScriptedProbe::new(&[]));
        assert!(pool.start_health_check_with(probe.clone()).is_none());
        assert!(probe.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probes_every_endpoint_each_tick() {
        let pool = pool(true);
        let probe = Arc::new(ScriptedProbe::new(&["http://bad:1"]));
        let handle = pool.start_health_check_with(probe.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(probe.calls.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(probe.calls.lock().unwrap().len(), 4);

        let stats = pool.stats();
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unhealthy, 1);
        let good = pool
            .endpoints()
            .into_iter()
            .find(|e| e.url == "http://good:1")
            .unwrap();
        assert_eq!(good.latency, Some(Duration::from_millis(25)));

        handle.stop().await;
        let calls = probe.calls.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.lock().unwrap().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn task_ends_when_pool_is_dropped() {
        let pool = pool(true);
        let probe = Arc::new(ScriptedProbe::new(&[]));
        let handle = pool.start_health_check_with(probe).unwrap();
        drop(pool);

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(handle.is_finished());
    }
}
