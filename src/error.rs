//! Error types for genproxy

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::storage::StoredResponse;

/// Result type for genproxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while proxying
///
/// A missing recording is not an error: stores report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Backing response store cannot be reached
    #[error("Response store unavailable: {0}")]
    StoreUnavailable(String),

    /// Live upstream round-trip failed
    #[error("Upstream request failed: {0}")]
    UpstreamFailure(String),

    /// A live response was fetched but the store refused it
    #[error("Live response not recorded: {source}")]
    NotRecorded {
        /// Store failure
        source: Box<ProxyError>,
        /// Live response still owed to the client
        response: Box<StoredResponse>,
    },

    /// Either leg of a CONNECT tunnel failed
    #[error("Tunnel I/O failure: {0}")]
    TunnelIo(String),

    /// HTTP message on the wire could not be parsed
    #[error("Malformed HTTP message: {0}")]
    MalformedMessage(String),

    /// Stored record has an unexpected layout
    #[error("Invalid record format: {0}")]
    InvalidFormat(String),

    /// Stored record failed its checksum
    #[error("Record corrupted: expected CRC {expected:#x}, got {actual:#x}")]
    CorruptedData {
        /// CRC32 carried by the record
        expected: u32,
        /// CRC32 computed over the payload
        actual: u32,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited on
        operation: &'static str,
        /// Configured deadline
        after: Duration,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Whether the backing store itself failed, as opposed to the data in it
    #[must_use]
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::NotRecorded { source, .. } => source.is_store_unavailable(),
            _ => false,
        }
    }
}
