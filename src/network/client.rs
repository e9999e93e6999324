//! HTTP client for forwarding requests to their real destination

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::CONTENT_LENGTH;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::config::Config;
use crate::proxy::{BufferedRequest, Upstream};
use crate::storage::StoredResponse;
use crate::{ProxyError, Result};

use super::http::is_hop_by_hop;

/// HTTP client for forwarding requests
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
    max_response_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client
    #[must_use]
    pub fn new(timeout: Duration, connect_timeout: Duration, max_response_size: usize) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        Self {
            client,
            timeout,
            max_response_size,
        }
    }

    /// Create a client from configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.timeouts.upstream(),
            config.timeouts.connect(),
            config.limits.max_response_size,
        )
    }

    /// Forward a request and buffer the complete response
    ///
    /// Hop-by-hop headers are dropped on the way out.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the round-trip exceeds the configured limit,
    /// `UpstreamFailure` for anything else that prevents a response
    pub async fn forward(&self, request: &BufferedRequest) -> Result<StoredResponse> {
        let uri = request.target_uri()?;
        debug!("Forwarding {} to {}", request.method, uri);

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) || *name == CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }

        let body = request.body.clone().unwrap_or_default();
        let http_request = builder
            .body(Full::new(body))
            .map_err(|e| ProxyError::UpstreamFailure(format!("Failed to build request: {e}")))?;

        match tokio::time::timeout(self.timeout, self.round_trip(http_request)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout {
                operation: "upstream request",
                after: self.timeout,
            }),
        }
    }

    async fn round_trip(&self, request: Request<Full<Bytes>>) -> Result<StoredResponse> {
        let response = self.client.request(request).await.map_err(|e| {
            warn!("Request failed: {e}");
            ProxyError::UpstreamFailure(format!("Request failed: {e}"))
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
            .collect();

        let body = Limited::new(response.into_body(), self.max_response_size)
            .collect()
            .await
            .map_err(|e| {
                ProxyError::UpstreamFailure(format!("Failed to read response body: {e}"))
            })?
            .to_bytes();

        Ok(StoredResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl Upstream for HttpClient {
    async fn send(&self, request: &BufferedRequest) -> Result<StoredResponse> {
        self.forward(request).await
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
