//! HTTP plumbing shared by the executor.
//!
//! [`HttpTransport`] is the seam the executor sends through; the reqwest
//! implementation keeps one client per proxy endpoint so cookies and
//! connections stay scoped to the exit they were created on.

mod reqwest_client;
mod types;

pub use reqwest_client::ReqwestTransport;
pub use types::{HttpResponse, OutboundRequest};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Sends a single request, optionally through a proxy, bounded by `timeout`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: &OutboundRequest,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// Transport-level failures. HTTP status codes are never errors here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid proxy '{0}'")]
    InvalidProxy(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}
