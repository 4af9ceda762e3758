use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ClearanceError, ClearanceSettings, ClearanceSolver, ClearanceTask};

#[derive(Debug, Serialize)]
struct SolveRequest<'a> {
    api_key: &'a str,
    site: &'a str,
}

#[derive(Debug, Deserialize)]
struct SolveResponse {
    #[serde(default)]
    solution: String,
    #[serde(default)]
    status: String,
}

/// Solver backed by an HTTP service that takes `{api_key, site}` and answers
/// `{solution, status}`.
#[derive(Debug, Clone)]
pub struct RemoteClearanceSolver {
    settings: ClearanceSettings,
    client: reqwest::Client,
}

impl RemoteClearanceSolver {
    pub fn new(settings: ClearanceSettings) -> Result<Self, ClearanceError> {
        if settings.endpoint.trim().is_empty() {
            return Err(ClearanceError::Configuration("empty solver endpoint".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| ClearanceError::Configuration(err.to_string()))?;
        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &ClearanceSettings {
        &self.settings
    }
}

#[async_trait]
impl ClearanceSolver for RemoteClearanceSolver {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn clearance_header(&self) -> &str {
        &self.settings.clearance_header
    }

    async fn solve(&self, task: &ClearanceTask) -> Result<String, ClearanceError> {
        log::debug!(
            "requesting clearance for {} (status {})",
            task.target_url,
            task.status
        );

        let response = self
            .client
            .post(&self.settings.endpoint)
            .json(&SolveRequest {
                api_key: &self.settings.api_key,
                site: &task.target_url,
            })
            .send()
            .await
            .map_err(|err| ClearanceError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClearanceError::Status(status.as_u16()));
        }

        let body: SolveResponse = response
            .json()
            .await
            .map_err(|err| ClearanceError::InvalidResponse(err.to_string()))?;

        if body.status != "success" {
            return Err(ClearanceError::Rejected(body.status));
        }
        if body.solution.is_empty() {
            return Err(ClearanceError::InvalidResponse("empty solution".into()));
        }
        Ok(body.solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;
    use std::time::Duration;

    fn settings(endpoint: String) -> ClearanceSettings {
        ClearanceSettings {
            endpoint,
            api_key: "solver-key".into(),
            clearance_header: "x-clearance".into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn returns_solution_on_success() {
        let (url, captured) = serve_once(200, r#"{"solution":"tok-123","status":"success"}"#).await;
        let solver = RemoteClearanceSolver::new(settings(format!("{url}/solve"))).unwrap();

        let token = solver
            .solve(&ClearanceTask::new("https://shop.invalid/cart", 503))
            .await
            .unwrap();
        assert_eq!(token, "tok-123");
        assert_eq!(solver.clearance_header(), "x-clearance");

        let body = captured.await.unwrap().json();
        assert_eq!(body["api_key"], "solver-key");
        assert_eq!(body["site"], "https://shop.invalid/cart");
    }

    #[tokio::test]
    async fn non_success_status_field_is_rejected() {
        let (url, _captured) = serve_once(200, r#"{"solution":"","status":"failed"}"#).await;
        let solver = RemoteClearanceSolver::new(settings(url)).unwrap();
        let err = solver
            .solve(&ClearanceTask::new("https://shop.invalid", 403))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearanceError::Rejected(status) if status == "failed"));
    }

    #[tokio::test]
    async fn http_error_is_reported() {
        let (url, _captured) = serve_once(502, "{}").await;
        let solver = RemoteClearanceSolver::new(settings(url)).unwrap();
        let err = solver
            .solve(&ClearanceTask::new("https://shop.invalid", 403))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearanceError::Status(502)));
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        assert!(matches!(
            RemoteClearanceSolver::new(settings(" ".into())),
            Err(ClearanceError::Configuration(_))
        ));
    }
}
