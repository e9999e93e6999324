//! HTTP handler for proxy traffic

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::proxy::{BufferedRequest, Dispatch, Dispatcher, ProxyState, Upstream};
use crate::storage::{ResponseStore, StoredResponse};
use crate::{ProxyError, Result};

use super::client::HttpClient;
use super::tunnel::TunnelRelay;

/// Status text sent when neither the store nor the destination answered
pub const UNREACHABLE_BODY: &str = "Cannot reach destination";

/// Answer to requests that name no destination
pub const NON_PROXY_BODY: &str = "This is a proxy server. Does not respond to non-proxy requests.";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Serves proxy requests on accepted connections
pub struct HttpHandler {
    dispatcher: Arc<Dispatcher>,
    client: Arc<HttpClient>,
    tunnel: TunnelRelay,
    max_request_size: usize,
}

impl HttpHandler {
    /// Create a handler
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        client: Arc<HttpClient>,
        tunnel: TunnelRelay,
        max_request_size: usize,
    ) -> Self {
        Self {
            dispatcher,
            client,
            tunnel,
            max_request_size,
        }
    }

    /// Wire up a handler from configuration and a response store
    ///
    /// The same HTTP client performs live calls for recording and
    /// pass-through forwarding.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the destination pattern is invalid
    pub fn from_config(config: &Config, store: Arc<dyn ResponseStore>) -> Result<Self> {
        let state = Arc::new(ProxyState::from_config(config)?);
        let client = Arc::new(HttpClient::from_config(config));
        let upstream: Arc<dyn Upstream> = Arc::clone(&client) as Arc<dyn Upstream>;
        let dispatcher = Arc::new(Dispatcher::new(state, store, upstream));

        Ok(Self::new(
            dispatcher,
            client,
            TunnelRelay::from_config(config),
            config.limits.max_request_size,
        ))
    }

    /// Dispatcher shared by all connections
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve HTTP/1.1 on one accepted connection until the client is done
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails at the protocol level
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |request: Request<Incoming>| {
            let handler = Arc::clone(&self);
            async move { handler.handle(request).await }
        });

        hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| ProxyError::Other(format!("Connection error: {e}")))
    }

    /// Handle one proxied request
    ///
    /// # Errors
    ///
    /// Never fails; every failure is turned into a response
    pub async fn handle<B>(
        self: Arc<Self>,
        request: Request<B>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if *request.method() == Method::CONNECT {
            return Ok(self.connect(request));
        }

        // Origin-form requests are addressed to the proxy itself.
        if request.uri().authority().is_none() {
            warn!("Rejecting non-proxy request {} {}", request.method(), request.uri());
            return Ok(text_response(StatusCode::BAD_REQUEST, NON_PROXY_BODY));
        }

        let request = BufferedRequest::from_hyper(request, self.max_request_size).await;
        let host = request.host().unwrap_or_default();
        info!("Got request {} {} for {}", request.method, request.path(), host);

        if self.dispatcher.intercepts(&host) {
            match self.dispatcher.dispatch(&request).await {
                Ok(Dispatch::Intercepted(response)) => return Ok(to_http_response(&response)),
                Ok(Dispatch::PassThrough) => {
                    debug!("Passing {} {} through", request.method, request.path());
                }
                Err(ProxyError::NotRecorded { source, response }) => {
                    warn!("Serving unrecorded response for {}: {}", host, source);
                    return Ok(to_http_response(&response));
                }
                Err(e) => warn!("Dispatch failed for {}, passing through: {}", host, e),
            }
        }

        Ok(self.pass_through(&request).await)
    }

    /// Forward a request unmodified to its destination
    async fn pass_through(&self, request: &BufferedRequest) -> Response<Full<Bytes>> {
        match self.client.forward(request).await {
            Ok(response) => to_http_response(&response),
            Err(e) => {
                warn!("Pass-through of {} {} failed: {}", request.method, request.uri, e);
                text_response(StatusCode::BAD_GATEWAY, UNREACHABLE_BODY)
            }
        }
    }

    /// Accept a CONNECT and hand the upgraded connection to a tunnel task
    fn connect<B>(&self, mut request: Request<B>) -> Response<Full<Bytes>> {
        let Some(authority) = request.uri().authority().cloned() else {
            return text_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
        };
        let Some(port) = authority.port_u16() else {
            return text_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
        };

        let target = authority.to_string();
        info!("Got CONNECT for {}", target);

        let upgrade = hyper::upgrade::on(&mut request);
        let tunnel = self.tunnel.clone();

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(e) => {
                    error!("CONNECT upgrade for {} failed: {}", target, e);
                    return;
                }
            };

            if tunnel.relays_http(port) {
                match tunnel.connect_and_relay(upgraded, &target).await {
                    Ok(exchanges) => debug!("Tunnel to {} closed after {} exchanges", target, exchanges),
                    Err(e) => error!("Tunnel to {} failed: {}", target, e),
                }
            } else {
                match tunnel.splice(upgraded, &target).await {
                    Ok((sent, received)) => {
                        debug!("Tunnel to {} closed ({} bytes up, {} down)", target, sent, received);
                    }
                    Err(e) => error!("Tunnel to {} failed: {}", target, e),
                }
            }
        });

        text_response(StatusCode::OK, "")
    }
}

/// Whether a header only applies to a single connection
#[must_use]
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Create a simple text response
#[must_use]
pub fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

/// Build the client-facing response for a stored or live response
///
/// Hop-by-hop headers and headers that are not valid HTTP are dropped.
#[must_use]
pub fn to_http_response(stored: &StoredResponse) -> Response<Full<Bytes>> {
    let Ok(status) = StatusCode::from_u16(stored.status) else {
        warn!("Response carries invalid status {}", stored.status);
        return text_response(StatusCode::BAD_GATEWAY, UNREACHABLE_BODY);
    };

    let mut response = Response::new(Full::new(Bytes::from(stored.body.clone())));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &stored.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) else {
            debug!("Dropping invalid header {:?}", name);
            continue;
        };
        if is_hop_by_hop(&name) {
            continue;
        }
        headers.append(name, value);
    }

    response
}
