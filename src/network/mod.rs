//! Network layer for genproxy
//!
//! Accepts proxy connections with bounded concurrency, serves HTTP/1.1 proxy
//! requests and relays CONNECT tunnels.

mod client;
mod handler;
mod http;
mod limiter;
mod tunnel;
pub mod wire;

pub use client::HttpClient;
pub use handler::NetworkHandler;
pub use http::{is_hop_by_hop, text_response, to_http_response, HttpHandler, NON_PROXY_BODY};
pub use limiter::{Admission, ConnectionLimiter};
pub use tunnel::{TunnelRelay, CANNOT_REACH_DESTINATION, PLAIN_HTTP_PORT};

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
