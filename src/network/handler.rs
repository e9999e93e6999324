//! Main network handler

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::Result;

use super::{ConnectionLimiter, HttpHandler, SHUTDOWN_TIMEOUT_MS};

/// Accepts proxy connections and serves each on its own task
pub struct NetworkHandler {
    listen_port: u16,
    http: Arc<HttpHandler>,
    limiter: ConnectionLimiter,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkHandler {
    /// Create a new network handler
    #[must_use]
    pub fn new(config: &Config, http: Arc<HttpHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            listen_port: config.listen_port,
            http,
            limiter: ConnectionLimiter::new(config.limits.max_connections),
            shutdown_tx,
        }
    }

    /// Sender that stops the accept loop when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured port on all interfaces and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let listener = TcpListener::bind(addr).await?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    ///
    /// In-flight connections get a bounded grace period to finish.
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };

                    let Some(admission) = self.limiter.admit(peer_addr) else {
                        warn!(
                            "Connection limit of {} reached, rejecting {}",
                            self.limiter.limit(),
                            peer_addr
                        );
                        drop(stream);
                        continue;
                    };

                    let http = Arc::clone(&self.http);
                    tasks.spawn(async move {
                        if let Err(e) = http.serve_connection(stream).await {
                            error!("Connection from {} failed: {}", admission.peer(), e);
                        }
                    });
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!("Connection task failed: {}", e);
                    }
                }
                _ = &mut ctrl_c => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.limiter.stop_admitting();
        drop(listener);

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting them",
                self.limiter.in_flight(),
                shutdown_timeout
            );
            tasks.abort_all();
        }

        info!("Shutdown complete");
        Ok(())
    }
}
