//! CONNECT tunnels
//!
//! Port-80 tunnels carry plain HTTP and are relayed one exchange at a time;
//! any other port is spliced through as opaque bytes.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::{ProxyError, Result};

use super::wire::{read_request, read_response, WireLimits};

/// Sent to the client when a tunnel fails before it got a response
pub const CANNOT_REACH_DESTINATION: &[u8] =
    b"HTTP/1.1 502 Cannot reach destination\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Port whose CONNECT tunnels carry plain HTTP
pub const PLAIN_HTTP_PORT: u16 = 80;

/// Relays HTTP/1.x exchanges between a tunnelled client and its destination
#[derive(Debug, Clone)]
pub struct TunnelRelay {
    limits: WireLimits,
    read_timeout: Duration,
    connect_timeout: Duration,
    plain_http_port: u16,
}

/// Why a relay loop stopped early
struct RelayFailure {
    error: ProxyError,
    /// Bytes of the current response already reached the client
    response_started: bool,
}

impl RelayFailure {
    fn before_response(error: impl Into<ProxyError>) -> Self {
        Self {
            error: error.into(),
            response_started: false,
        }
    }

    fn during_response(error: impl Into<ProxyError>) -> Self {
        Self {
            error: error.into(),
            response_started: true,
        }
    }
}

impl TunnelRelay {
    /// Create a relay
    #[must_use]
    pub fn new(limits: WireLimits, read_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            limits,
            read_timeout,
            connect_timeout,
            plain_http_port: PLAIN_HTTP_PORT,
        }
    }

    /// Relay tunnels to `port` exchange by exchange instead of [`PLAIN_HTTP_PORT`]
    #[must_use]
    pub fn with_plain_http_port(mut self, port: u16) -> Self {
        self.plain_http_port = port;
        self
    }

    /// Whether a CONNECT to `port` is relayed as HTTP rather than spliced
    #[must_use]
    pub fn relays_http(&self, port: u16) -> bool {
        port == self.plain_http_port
    }

    /// Create a relay from configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            WireLimits::from(&config.limits),
            config.timeouts.tunnel_read(),
            config.timeouts.connect(),
        )
    }

    /// Open the upstream leg to `target` and relay until either side is done
    ///
    /// Returns the number of completed exchanges.
    ///
    /// # Errors
    ///
    /// Returns error if the destination cannot be reached or a leg fails;
    /// the client has been answered with a 502 where that was still possible
    pub async fn connect_and_relay<C>(&self, mut client: C, target: &str) -> Result<usize>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let upstream = match self.connect(target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                reject(&mut client).await;
                close(client, "client").await;
                return Err(e);
            }
        };

        self.relay(client, upstream).await
    }

    /// Relay exchanges between two established streams
    ///
    /// Both streams are shut down and dropped before this returns, on every
    /// path.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the relay
    pub async fn relay<C, U>(&self, client: C, upstream: U) -> Result<usize>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = BufStream::new(client);
        let mut upstream = BufStream::new(upstream);

        let outcome = self.relay_loop(&mut client, &mut upstream).await;

        let mut client = client.into_inner();
        if let Err(failure) = &outcome {
            if !failure.response_started {
                reject(&mut client).await;
            }
        }

        close(client, "client").await;
        close(upstream.into_inner(), "upstream").await;

        outcome.map_err(|failure| failure.error)
    }

    async fn relay_loop<C, U>(
        &self,
        client: &mut BufStream<C>,
        upstream: &mut BufStream<U>,
    ) -> std::result::Result<usize, RelayFailure>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let mut exchanges = 0;

        loop {
            let request = match timeout(self.read_timeout, read_request(client, &self.limits)).await
            {
                Err(_) => {
                    debug!("Tunnel idle for {:?}, closing", self.read_timeout);
                    return Ok(exchanges);
                }
                Ok(Ok(None)) => {
                    debug!("Client closed tunnel after {} exchanges", exchanges);
                    return Ok(exchanges);
                }
                Ok(Ok(Some(request))) => request,
                Ok(Err(e)) => return Err(RelayFailure::before_response(e)),
            };

            debug!(
                "Tunnel request: {} ({} bytes)",
                request.method,
                request.bytes.len()
            );

            upstream
                .write_all(&request.bytes)
                .await
                .map_err(|e| RelayFailure::before_response(io_failure("write to upstream", &e)))?;
            upstream
                .flush()
                .await
                .map_err(|e| RelayFailure::before_response(io_failure("flush to upstream", &e)))?;

            let response = match timeout(
                self.read_timeout,
                read_response(upstream, &request.method, &self.limits),
            )
            .await
            {
                Err(_) => {
                    return Err(RelayFailure::before_response(ProxyError::Timeout {
                        operation: "upstream response",
                        after: self.read_timeout,
                    }))
                }
                Ok(Err(e)) => return Err(RelayFailure::before_response(e)),
                Ok(Ok(response)) => response,
            };

            client
                .write_all(&response.bytes)
                .await
                .map_err(|e| RelayFailure::during_response(io_failure("write to client", &e)))?;
            client
                .flush()
                .await
                .map_err(|e| RelayFailure::during_response(io_failure("flush to client", &e)))?;

            exchanges += 1;
            debug!("Tunnel response: {} ({} bytes)", response.status, response.bytes.len());

            if request.close || response.close {
                return Ok(exchanges);
            }
        }
    }

    /// Copy bytes both ways between `client` and `target` without looking at them
    ///
    /// Returns bytes sent upstream and bytes sent back to the client.
    ///
    /// # Errors
    ///
    /// Returns error if the destination cannot be reached or a copy fails
    pub async fn splice<C>(&self, mut client: C, target: &str) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut upstream = match self.connect(target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                close(client, "client").await;
                return Err(e);
            }
        };

        let copied = tokio::io::copy_bidirectional(&mut client, &mut upstream)
            .await
            .map_err(|e| io_failure("splice", &e));

        close(client, "client").await;
        close(upstream, "upstream").await;

        copied
    }

    async fn connect(&self, target: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::TunnelIo(format!("connect to {target}: {e}"))),
            Err(_) => Err(ProxyError::Timeout {
                operation: "tunnel connect",
                after: self.connect_timeout,
            }),
        }
    }
}

/// Best-effort 502 to a client that has not seen a response yet
async fn reject<C>(client: &mut C)
where
    C: AsyncWrite + Unpin,
{
    let sent = async {
        client.write_all(CANNOT_REACH_DESTINATION).await?;
        client.flush().await
    };
    if let Err(e) = sent.await {
        debug!("Could not send 502 to client: {}", e);
    }
}

/// Shut down and drop one leg
async fn close<S>(mut stream: S, leg: &str)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.shutdown().await {
        debug!("Shutdown of {} leg failed: {}", leg, e);
    }
}

fn io_failure(context: &str, error: &std::io::Error) -> ProxyError {
    ProxyError::TunnelIo(format!("{context}: {error}"))
}
