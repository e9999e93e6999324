//! Record/playback decision for intercepted requests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::Mode;
use crate::fingerprint::{fingerprint_request, Fingerprint};
use crate::storage::{ResponseStore, StoredResponse};
use crate::{ProxyError, Result};

use super::request::BufferedRequest;
use super::state::ProxyState;

/// Outcome of dispatching one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Answer the client with this response
    Intercepted(StoredResponse),
    /// Let the request continue to its destination unmodified
    PassThrough,
}

/// Performs live round-trips to the real destination
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and return the complete response
    ///
    /// # Errors
    ///
    /// Returns `UpstreamFailure` or `Timeout` if no response was obtained
    async fn send(&self, request: &BufferedRequest) -> Result<StoredResponse>;
}

/// Routes intercepted requests through record or playback
pub struct Dispatcher {
    state: Arc<ProxyState>,
    store: Arc<dyn ResponseStore>,
    upstream: Arc<dyn Upstream>,
    stats: Counters,
}

#[derive(Default)]
struct Counters {
    recorded: AtomicUsize,
    replayed: AtomicUsize,
    misses: AtomicUsize,
    store_failures: AtomicUsize,
    pass_throughs: AtomicUsize,
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(
        state: Arc<ProxyState>,
        store: Arc<dyn ResponseStore>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            state,
            store,
            upstream,
            stats: Counters::default(),
        }
    }

    /// Shared proxy settings
    #[must_use]
    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Whether requests to `host` should be dispatched at all
    #[must_use]
    pub fn intercepts(&self, host: &str) -> bool {
        self.state.intercepts(host)
    }

    /// Dispatch a request according to the current mode
    ///
    /// # Errors
    ///
    /// Returns `NotRecorded` if a live response could not be stored. The
    /// error carries that response so the caller can still serve it.
    pub async fn dispatch(&self, request: &BufferedRequest) -> Result<Dispatch> {
        let outcome = match self.state.mode() {
            Mode::Record => self.record(request).await,
            Mode::Playback => Ok(self.playback(request).await),
        };

        if matches!(outcome, Ok(Dispatch::PassThrough)) {
            self.stats.pass_throughs.fetch_add(1, Ordering::Relaxed);
        }

        outcome
    }

    /// Fetch live, store, and answer with the live response
    async fn record(&self, request: &BufferedRequest) -> Result<Dispatch> {
        info!("*** RECORD *** {} {}", request.method, request.uri);

        let response = match self.upstream.send(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Upstream failed, passing through: {e}");
                return Ok(Dispatch::PassThrough);
            }
        };

        let key = fingerprint(request);
        if let Err(e) = self.store.put(&key, &response).await {
            self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
            error!("Failed to record {}: {e}", key.short());
            return Err(ProxyError::NotRecorded {
                source: Box::new(e),
                response: Box::new(response),
            });
        }

        self.stats.recorded.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Recorded {} {} -> {} ({})",
            request.method,
            request.path(),
            response.status,
            key.short()
        );

        Ok(Dispatch::Intercepted(response))
    }

    /// Answer from the store, never contacting the upstream
    async fn playback(&self, request: &BufferedRequest) -> Dispatch {
        info!("*** PLAYBACK *** {} {}", request.method, request.uri);

        let key = fingerprint(request);
        match self.store.get(&key).await {
            Ok(Some(response)) => {
                self.stats.replayed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Playback hit: {} {} -> {} ({})",
                    request.method,
                    request.path(),
                    response.status,
                    key.short()
                );
                Dispatch::Intercepted(response)
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Playback miss: {} {} ({})",
                    request.method,
                    request.path(),
                    key.short()
                );
                Dispatch::PassThrough
            }
            Err(e) if e.is_store_unavailable() => {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                error!("Playback lookup for {} failed: {e}", key.short());
                Dispatch::PassThrough
            }
            Err(e) => {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding unusable record {}: {e}", key.short());
                Dispatch::PassThrough
            }
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            recorded: self.stats.recorded.load(Ordering::Relaxed),
            replayed: self.stats.replayed.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            store_failures: self.stats.store_failures.load(Ordering::Relaxed),
            pass_throughs: self.stats.pass_throughs.load(Ordering::Relaxed),
        }
    }
}

fn fingerprint(request: &BufferedRequest) -> Fingerprint {
    fingerprint_request(&request.fingerprint_request())
}

/// Dispatch statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Live responses written to the store
    pub recorded: usize,
    /// Responses served from the store
    pub replayed: usize,
    /// Playback lookups with no record
    pub misses: usize,
    /// Store reads or writes that failed
    pub store_failures: usize,
    /// Requests handed back for pass-through
    pub pass_throughs: usize,
}
