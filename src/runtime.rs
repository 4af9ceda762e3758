//! Runtime assembly.
//!
//! Wires the proxy pool, the error monitor and the retrying executor from a
//! [`RuntimeConfig`], restores persisted monitor state, and owns the
//! background health check so shutdown can stop it and flush state.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ProxySpec, RuntimeConfig};
use crate::executor::{ExecutorError, RetryPolicy, RetryingRequestExecutor};
use crate::external_deps::alerts::AlertSink;
use crate::external_deps::clearance::{ClearanceError, ClearanceSolver, RemoteClearanceSolver};
use crate::modules::monitor::{ErrorMonitor, MonitorError};
use crate::modules::proxy::{HealthCheckHandle, HealthProbe, ProxyPool};
use crate::transport::{HttpResponse, HttpTransport, OutboundRequest, ReqwestTransport};

/// Result alias used by the runtime layer.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("error monitor failure: {0}")]
	Monitor(#[from] MonitorError),
	#[error("clearance solver setup failed: {0}")]
	Clearance(#[from] ClearanceError),
	#[error(transparent)]
	Executor(#[from] ExecutorError),
}

pub struct CheckoutRuntimeBuilder {
	config: RuntimeConfig,
	transport: Option<Arc<dyn HttpTransport>>,
	solver: Option<Arc<dyn ClearanceSolver>>,
	probe: Option<Arc<dyn HealthProbe>>,
	sinks: Vec<Arc<dyn AlertSink>>,
	cancel: Option<CancellationToken>,
}

impl CheckoutRuntimeBuilder {
	pub fn new() -> Self {
		Self {
			config: RuntimeConfig::default(),
			transport: None,
			solver: None,
			probe: None,
			sinks: Vec::new(),
			cancel: None,
		}
	}

	pub fn with_config(mut self, config: RuntimeConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_config_file(mut self, path: impl AsRef<Path>) -> RuntimeResult<Self> {
		self.config = RuntimeConfig::from_path(path)?;
		Ok(self)
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.proxies = proxies
			.into_iter()
			.map(|url| ProxySpec::Url(url.into()))
			.collect();
		self
	}

	pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.config.retry = policy;
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Overrides the solver built from the `challenge` config section.
	pub fn with_solver(mut self, solver: Arc<dyn ClearanceSolver>) -> Self {
		self.solver = Some(solver);
		self
	}

	pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
		self.probe = Some(probe);
		self
	}

	pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
		self.sinks.push(sink);
		self
	}

	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancel = Some(token);
		self
	}

	pub fn build(self) -> RuntimeResult<CheckoutRuntime> {
		CheckoutRuntime::assemble(self)
	}
}

impl Default for CheckoutRuntimeBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Proxy pool, error monitor and executor sharing one configuration.
pub struct CheckoutRuntime {
	config: RuntimeConfig,
	pool: ProxyPool,
	monitor: ErrorMonitor,
	executor: RetryingRequestExecutor,
	probe: Option<Arc<dyn HealthProbe>>,
	health: Option<HealthCheckHandle>,
	cancel: CancellationToken,
}

impl CheckoutRuntime {
	pub fn builder() -> CheckoutRuntimeBuilder {
		CheckoutRuntimeBuilder::new()
	}

	pub fn from_config(config: RuntimeConfig) -> RuntimeResult<Self> {
		CheckoutRuntimeBuilder::new().with_config(config).build()
	}

	fn assemble(builder: CheckoutRuntimeBuilder) -> RuntimeResult<Self> {
		let CheckoutRuntimeBuilder {
			config,
			transport,
			solver,
			probe,
			sinks,
			cancel,
		} = builder;
		config.validate()?;

		let pool = ProxyPool::new(config.proxy.clone());
		for spec in &config.proxies {
			pool.add(spec.url(), spec.weight());
		}
		if !config.proxies.is_empty() {
			pool.enable();
		}

		let monitor = ErrorMonitor::with_settings(config.alerts.clone(), &config.monitor);
		monitor.load()?;
		// Alert settings from the config file take precedence over persisted ones.
		monitor.set_config(config.alerts.clone());
		for sink in sinks {
			monitor.register_sink(sink);
		}

		let solver = match (solver, &config.challenge) {
			(Some(solver), _) => Some(solver),
			(None, Some(settings)) => {
				Some(Arc::new(RemoteClearanceSolver::new(settings.clone())?) as Arc<dyn ClearanceSolver>)
			}
			(None, None) => None,
		};

		let transport = transport
			.unwrap_or_else(|| Arc::new(ReqwestTransport::new()) as Arc<dyn HttpTransport>);
		let cancel = cancel.unwrap_or_default();
		let mut executor = RetryingRequestExecutor::new(transport, pool.clone(), monitor.clone())
			.with_policy(config.retry.clone())
			.with_cancellation(cancel.clone());
		if let Some(solver) = solver {
			executor = executor.with_solver(solver);
		}

		log::info!(
			"checkout runtime ready ({} proxies, {} rotation, {} max attempts)",
			pool.len(),
			config.proxy.rotation_mode,
			config.retry.max_attempts
		);

		Ok(Self {
			config,
			pool,
			monitor,
			executor,
			probe,
			health: None,
			cancel,
		})
	}

	/// Starts the proxy health check when the pool has endpoints and health
	/// checking is enabled. Must be called from within a tokio runtime.
	pub fn start(&mut self) {
		if self.health.is_some() || self.pool.is_empty() {
			return;
		}
		self.health = match &self.probe {
			Some(probe) => self.pool.start_health_check_with(probe.clone()),
			None => self.pool.start_health_check(),
		};
	}

	pub fn is_health_check_running(&self) -> bool {
		self.health.as_ref().is_some_and(|handle| !handle.is_finished())
	}

	pub async fn execute(&self, request: OutboundRequest) -> RuntimeResult<HttpResponse> {
		Ok(self.executor.execute(request).await?)
	}

	pub fn config(&self) -> &RuntimeConfig {
		&self.config
	}

	pub fn pool(&self) -> &ProxyPool {
		&self.pool
	}

	pub fn monitor(&self) -> &ErrorMonitor {
		&self.monitor
	}

	pub fn executor(&self) -> &RetryingRequestExecutor {
		&self.executor
	}

	/// Token that aborts in-flight executions when cancelled.
	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Stops the health check and persists the monitor state.
	pub async fn shutdown(mut self) -> RuntimeResult<()> {
		if let Some(handle) = self.health.take() {
			handle.stop().await;
		}
		if let Err(err) = self.monitor.persist() {
			log::error!("failed to persist error monitor state: {err}");
			return Err(err.into());
		}
		log::info!("checkout runtime stopped");
		Ok(())
	}
}
