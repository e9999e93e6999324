//! Process-wide proxy settings shared by every connection

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use tracing::info;

use crate::config::{Config, Mode};
use crate::{ProxyError, Result};

/// Decides which hosts the dispatcher intercepts
pub trait DestinationMatcher: Send + Sync + fmt::Debug {
    /// Whether requests to `host` go through record/playback
    fn matches(&self, host: &str) -> bool;
}

/// Destination matcher backed by a regular expression
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    pattern: Regex,
}

impl RegexMatcher {
    /// Compile `pattern`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the pattern is not a valid regex
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ProxyError::ConfigError(format!("Invalid destination '{pattern}': {e}")))?;
        Ok(Self { pattern })
    }
}

impl DestinationMatcher for RegexMatcher {
    fn matches(&self, host: &str) -> bool {
        self.pattern.is_match(host)
    }
}

/// One consistent view of the settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Record or playback
    pub mode: Mode,
    /// Intercepted hosts
    pub destination: Arc<dyn DestinationMatcher>,
}

/// Settings read on every request and replaced whole by the admin path
///
/// Readers load an immutable snapshot, so a concurrent update is observed
/// either entirely or not at all.
pub struct ProxyState {
    settings: ArcSwap<Settings>,
}

impl ProxyState {
    /// Create state with an initial mode and destination matcher
    #[must_use]
    pub fn new(mode: Mode, destination: Arc<dyn DestinationMatcher>) -> Self {
        Self {
            settings: ArcSwap::from_pointee(Settings { mode, destination }),
        }
    }

    /// Build state from configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the destination pattern is invalid
    pub fn from_config(config: &Config) -> Result<Self> {
        let matcher = RegexMatcher::new(&config.destination)?;
        Ok(Self::new(config.mode, Arc::new(matcher)))
    }

    /// Current settings snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.settings.load().mode
    }

    /// Whether requests to `host` are intercepted
    #[must_use]
    pub fn intercepts(&self, host: &str) -> bool {
        self.settings.load().destination.matches(host)
    }

    /// Switch between record and playback
    pub fn set_mode(&self, mode: Mode) {
        self.settings.rcu(|current| Settings {
            mode,
            destination: Arc::clone(&current.destination),
        });
        info!("Proxy mode set to {:?}", mode);
    }

    /// Replace the destination matcher
    pub fn set_destination(&self, destination: Arc<dyn DestinationMatcher>) {
        info!("Destination matcher set to {:?}", destination);
        self.settings.rcu(|current| Settings {
            mode: current.mode,
            destination: Arc::clone(&destination),
        });
    }
}

impl fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyState")
            .field("settings", &self.snapshot())
            .finish()
    }
}
