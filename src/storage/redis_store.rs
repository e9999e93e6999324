//! Redis-backed response store

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::format::{decode_record, encode_record};
use super::{storage_key, ResponseStore, StoredResponse};
use crate::fingerprint::Fingerprint;
use crate::{ProxyError, Result};

/// Attempts made to (re)establish the connection before giving up
const CONNECT_RETRIES: usize = 2;

/// Response store on a shared Redis connection
///
/// `ConnectionManager` multiplexes one connection and reconnects on failure;
/// cloning it per call is cheap.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect to the Redis server at `address`
    ///
    /// `timeout` bounds connecting and every command, so a stalled server
    /// surfaces as `StoreUnavailable` instead of hanging the request.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the URL is invalid or the server cannot
    /// be reached
    pub async fn connect(
        address: &str,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(address).map_err(unavailable)?;
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECT_RETRIES)
            .set_connection_timeout(timeout)
            .set_response_timeout(timeout);
        let conn = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(unavailable)?;

        let prefix = prefix.into();
        info!("Connected to response store at {} (prefix {:?})", address, prefix);

        Ok(Self { conn, prefix })
    }
}

#[async_trait]
impl ResponseStore for RedisStore {
    async fn put(&self, key: &Fingerprint, response: &StoredResponse) -> Result<()> {
        let data = encode_record(key, response)?;
        let full_key = storage_key(&self.prefix, key);

        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&full_key, data)
            .await
            .map_err(unavailable)?;

        debug!("SET {}", full_key);
        Ok(())
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<StoredResponse>> {
        let full_key = storage_key(&self.prefix, key);

        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn.get(&full_key).await.map_err(unavailable)?;

        let Some(data) = data else {
            debug!("GET {} -> nil", full_key);
            return Ok(None);
        };

        let record = decode_record(&data)?;
        if record.fingerprint != *key {
            return Err(ProxyError::InvalidFormat(format!(
                "Record under {full_key} belongs to {}",
                record.fingerprint.short()
            )));
        }

        Ok(Some(record.response))
    }
}

fn unavailable(err: redis::RedisError) -> ProxyError {
    ProxyError::StoreUnavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_invalid_address_is_unavailable() {
        let result = RedisStore::connect("not a url", "test:", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProxyError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            let store =
                RedisStore::connect(&format!("redis://{addr}"), "test:", Duration::from_millis(200))
                    .await?;
            store.get(&Fingerprint::from_bytes([7; 32])).await
        })
        .await
        .expect("store calls should be bounded by their timeout");

        assert!(matches!(outcome, Err(ProxyError::StoreUnavailable(_))));
    }
}
