//! Fully buffered inbound request

use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::HOST;
use hyper::{HeaderMap, Method, Uri};
use tracing::warn;

use crate::fingerprint;
use crate::{ProxyError, Result};

/// An intercepted request with its body read into memory
///
/// The request is kept intact so it can still be forwarded unmodified when
/// the dispatcher passes it through.
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    /// HTTP method
    pub method: Method,
    /// Request target as received (absolute-form from proxy clients)
    pub uri: Uri,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body, `None` if it could not be read
    pub body: Option<Bytes>,
}

impl BufferedRequest {
    /// Build a request from parts
    #[must_use]
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Option<Bytes>) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// Buffer an incoming hyper request
    ///
    /// A body that fails to arrive or exceeds `max_body_size` is recorded as
    /// unreadable rather than failing the request.
    pub async fn from_hyper<B>(request: hyper::Request<B>, max_body_size: usize) -> Self
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();

        let body = match read_body(body, max_body_size).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Request body unreadable, fingerprinting without it: {e}");
                None
            }
        };

        Self::new(parts.method, parts.uri, parts.headers, body)
    }

    /// Target host, with port when one was given
    ///
    /// Taken from the request target, falling back to the `Host` header.
    #[must_use]
    pub fn host(&self) -> Option<String> {
        if let Some(authority) = self.uri.authority() {
            return Some(match authority.port_u16() {
                Some(port) => format!("{}:{port}", authority.host()),
                None => authority.host().to_string(),
            });
        }

        self.headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .filter(|host| !host.is_empty())
            .map(str::to_string)
    }

    /// Path and query of the request target
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri
            .path_and_query()
            .map_or("/", |path_and_query| path_and_query.as_str())
    }

    /// Fields identifying this request in the store
    #[must_use]
    pub fn fingerprint_request(&self) -> fingerprint::Request {
        fingerprint::Request {
            method: self.method.as_str().to_string(),
            host: self.host().unwrap_or_default(),
            path: self.path().to_string(),
            body: self.body.as_ref().map(|body| body.to_vec()),
        }
    }

    /// Absolute URI to send upstream
    ///
    /// # Errors
    ///
    /// Returns error if no host is known or the URI cannot be built
    pub fn target_uri(&self) -> Result<Uri> {
        if self.uri.scheme().is_some() && self.uri.authority().is_some() {
            return Ok(self.uri.clone());
        }

        let host = self
            .host()
            .ok_or_else(|| ProxyError::Other("Request has no target host".to_string()))?;
        let uri = format!("http://{host}{}", self.path());

        uri.parse::<Uri>()
            .map_err(|e| ProxyError::Other(format!("Invalid URI '{uri}': {e}")))
    }
}

/// Read a body with a size limit
///
/// # Errors
///
/// Returns error if the body is too large or the read fails
pub async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let collected = Limited::new(body, max_size).collect().await.map_err(|e| {
        if e.is::<http_body_util::LengthLimitError>() {
            ProxyError::DataTooLarge {
                size: max_size.saturating_add(1),
                limit: max_size,
            }
        } else {
            ProxyError::Other(format!("Failed to read body: {e}"))
        }
    })?;

    Ok(collected.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn request(uri: &str) -> BufferedRequest {
        BufferedRequest::new(
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Some(Bytes::new()),
        )
    }

    #[test]
    fn test_host_from_absolute_uri() {
        assert_eq!(
            request("http://example.com/a").host().as_deref(),
            Some("example.com")
        );
        assert_eq!(
            request("http://example.com:8080/a").host().as_deref(),
            Some("example.com:8080")
        );
    }

    #[test]
    fn test_host_from_header() {
        let mut req = request("/a");
        req.headers.insert(HOST, "example.com".parse().unwrap());

        assert_eq!(req.host().as_deref(), Some("example.com"));
        assert_eq!(
            req.target_uri().unwrap().to_string(),
            "http://example.com/a"
        );
    }

    #[test]
    fn test_missing_host() {
        let req = request("/a");
        assert!(req.host().is_none());
        assert!(req.target_uri().is_err());
    }

    #[test]
    fn test_path_includes_query() {
        assert_eq!(request("http://example.com/a?b=1").path(), "/a?b=1");
        assert_eq!(request("http://example.com").path(), "/");
    }

    #[test]
    fn test_fingerprint_request_fields() {
        let req = request("http://example.com/a");
        let fields = req.fingerprint_request();

        assert_eq!(fields.method, "GET");
        assert_eq!(fields.host, "example.com");
        assert_eq!(fields.path, "/a");
        assert_eq!(fields.body, Some(vec![]));
    }

    #[tokio::test]
    async fn test_read_body() {
        let data = Bytes::from("test data");
        let result = read_body(Full::new(data.clone()), 1024).await;
        assert_eq!(result.unwrap(), data);
    }

    #[tokio::test]
    async fn test_read_body_too_large() {
        let body = Full::new(Bytes::from("test data that is too long"));
        let result = read_body(body, 5).await;
        assert!(matches!(result, Err(ProxyError::DataTooLarge { limit: 5, .. })));
    }

    #[tokio::test]
    async fn test_oversized_body_is_unreadable() {
        let request = hyper::Request::builder()
            .method("POST")
            .uri("http://example.com/upload")
            .body(Full::new(Bytes::from("0123456789")))
            .unwrap();

        let buffered = BufferedRequest::from_hyper(request, 4).await;
        assert!(buffered.body.is_none());
        assert_eq!(buffered.method, Method::POST);
    }
}
