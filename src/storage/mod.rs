//! Response store: fingerprint-keyed persistence of recorded responses

mod format;
mod memory;
mod redis_store;

pub use format::{decode_record, encode_record, RECORD_MAGIC, RECORD_VERSION};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;

use crate::fingerprint::Fingerprint;
use crate::Result;

/// Recorded HTTP response
///
/// Header values are kept as raw bytes so a record replays exactly what the
/// upstream sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers in upstream order
    pub headers: Vec<(String, Vec<u8>)>,
    /// Response body
    pub body: Vec<u8>,
}

/// A stored response together with the key it was stored under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Fingerprint of the recorded request
    pub fingerprint: Fingerprint,
    /// Recorded response
    pub response: StoredResponse,
}

/// Key/value persistence for recorded responses
///
/// Implementations must tolerate concurrent calls; every record is addressed
/// by its own key and written whole.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Persist `response` under `key`, replacing any previous record
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backend cannot be reached
    async fn put(&self, key: &Fingerprint, response: &StoredResponse) -> Result<()>;

    /// Fetch the response recorded under `key`, `Ok(None)` if there is none
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backend cannot be reached, or a
    /// format error if the stored bytes are damaged
    async fn get(&self, key: &Fingerprint) -> Result<Option<StoredResponse>>;
}

/// Full backend key for a fingerprint
#[must_use]
pub fn storage_key(prefix: &str, key: &Fingerprint) -> String {
    format!("{prefix}{key}")
}
