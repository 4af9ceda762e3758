//! Anti-bot challenge solving.
//!
//! When a target answers with a challenge status, the executor asks a
//! [`ClearanceSolver`] for a clearance token and replays the request with the
//! token attached as a header.

mod remote;

pub use remote::RemoteClearanceSolver;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::duration_secs;

pub const DEFAULT_CLEARANCE_HEADER: &str = "cf-clearance";

/// Remote solver endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceSettings {
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_clearance_header")]
    pub clearance_header: String,
    #[serde(
        default = "default_solve_timeout",
        rename = "timeout_secs",
        with = "duration_secs"
    )]
    pub timeout: Duration,
}

fn default_clearance_header() -> String {
    DEFAULT_CLEARANCE_HEADER.to_string()
}

fn default_solve_timeout() -> Duration {
    Duration::from_secs(60)
}

/// The challenged request as seen by a solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearanceTask {
    pub target_url: String,
    pub status: u16,
}

impl ClearanceTask {
    pub fn new(target_url: impl Into<String>, status: u16) -> Self {
        Self {
            target_url: target_url.into(),
            status,
        }
    }
}

/// Produces a clearance token for a challenged URL.
#[async_trait]
pub trait ClearanceSolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Header that carries the returned token on the replayed request.
    fn clearance_header(&self) -> &str {
        DEFAULT_CLEARANCE_HEADER
    }

    async fn solve(&self, task: &ClearanceTask) -> Result<String, ClearanceError>;
}

#[derive(Debug, Error)]
pub enum ClearanceError {
    #[error("clearance solver misconfigured: {0}")]
    Configuration(String),
    #[error("clearance request failed: {0}")]
    Request(String),
    #[error("clearance solver returned status {0}")]
    Status(u16),
    #[error("clearance solver rejected the task: {0}")]
    Rejected(String),
    #[error("clearance solver response invalid: {0}")]
    InvalidResponse(String),
}
