use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use tokio::sync::Mutex;

use super::{HttpResponse, HttpTransport, OutboundRequest, TransportError};

/// Reqwest transport with one cookie-keeping client per proxy endpoint.
pub struct ReqwestTransport {
    base_headers: HeaderMap,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_default_headers(HeaderMap::new())
    }

    /// Headers sent on every request unless the request overrides them.
    pub fn with_default_headers(base_headers: HeaderMap) -> Self {
        Self {
            base_headers,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client, TransportError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .default_headers(self.base_headers.clone());

        builder = match proxy {
            Some(endpoint) => builder.proxy(
                reqwest::Proxy::all(endpoint)
                    .map_err(|_| TransportError::InvalidProxy(endpoint.to_string()))?,
            ),
            None => builder.no_proxy(),
        };

        let client = builder
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &OutboundRequest,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let client = self.client(proxy).await?;

        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Body(err.to_string())
            }
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
