//! In-process response store

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::format::{decode_record, encode_record};
use super::{storage_key, ResponseStore, StoredResponse};
use crate::fingerprint::Fingerprint;
use crate::{ProxyError, Result};

/// Response store kept in a concurrent map
///
/// Records are held in their encoded form, so reads go through the same
/// decoding and integrity checks as the Redis backend.
pub struct MemoryStore {
    records: DashMap<String, Vec<u8>>,
    prefix: String,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            records: DashMap::new(),
            prefix: prefix.into(),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a record exists under `key`
    #[must_use]
    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.records.contains_key(&storage_key(&self.prefix, key))
    }

    /// Raw stored bytes under a full backend key
    #[must_use]
    pub fn raw(&self, full_key: &str) -> Option<Vec<u8>> {
        self.records.get(full_key).map(|entry| entry.value().clone())
    }

    /// Get lookup hit count
    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get lookup miss count
    #[must_use]
    pub fn miss_count(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    /// Remove every record
    pub fn clear(&self) {
        self.records.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(crate::config::StoreConfig::default().prefix)
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn put(&self, key: &Fingerprint, response: &StoredResponse) -> Result<()> {
        let data = encode_record(key, response)?;
        debug!("Storing {} bytes under {}", data.len(), key.short());
        self.records.insert(storage_key(&self.prefix, key), data);
        Ok(())
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<StoredResponse>> {
        let Some(data) = self.raw(&storage_key(&self.prefix, key)) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let record = decode_record(&data)?;
        if record.fingerprint != *key {
            return Err(ProxyError::InvalidFormat(format!(
                "Record under {} belongs to {}",
                key.short(),
                record.fingerprint.short()
            )));
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(record.response))
    }
}
