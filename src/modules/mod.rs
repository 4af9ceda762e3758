//! Core services module
//!
//! Proxy rotation with health tracking, and error monitoring with alerting.

pub mod monitor;
pub mod proxy;

// Re-export commonly used types
pub use monitor::{
    Alert, AlertConfig, AlertThresholdState, ErrorCategory, ErrorEvent, ErrorMonitor,
    EventDetails, EventId, MonitorError, MonitorStats, Severity,
};
pub use proxy::{
    HealthCheckHandle, HealthProbe, ProbeError, ProxyEndpoint, ProxyError, ProxyPool,
    ProxyPoolConfig, ProxyPoolStats, ReqwestHealthProbe, RotationMode,
};
