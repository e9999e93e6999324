//! Request fingerprinting for deterministic store keys

use std::fmt;

use sha2::{Digest, Sha256};

/// Request fields that identify a recording
///
/// Headers are deliberately absent: two requests differing only in headers
/// share a fingerprint.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method (e.g., "GET", "POST")
    pub method: String,
    /// Target host, optionally with port
    pub host: String,
    /// Request path including any query string
    pub path: String,
    /// Request body, `None` when it could not be read
    pub body: Option<Vec<u8>>,
}

/// SHA-256 identity of a request
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Wrap raw digest bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding, used as the store key
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes in hex, for logs
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Compute the fingerprint of a request
///
/// The digest covers, length-prefixed:
/// 1. Method (uppercase normalized)
/// 2. Host (lowercase, default port stripped)
/// 3. Path (normalized)
/// 4. Body, or a marker byte when the body was unreadable
#[must_use]
pub fn fingerprint_request(request: &Request) -> Fingerprint {
    let mut hasher = Sha256::new();

    let method = request.method.to_uppercase();
    hasher.update((method.len() as u32).to_le_bytes());
    hasher.update(method.as_bytes());

    let host = normalize_host(&request.host);
    hasher.update((host.len() as u32).to_le_bytes());
    hasher.update(host.as_bytes());

    let path = normalize_path(&request.path);
    hasher.update((path.len() as u32).to_le_bytes());
    hasher.update(path.as_bytes());

    match &request.body {
        Some(body) => {
            hasher.update([1u8]);
            hasher.update((body.len() as u64).to_le_bytes());
            hasher.update(body);
        }
        None => hasher.update([0u8]),
    }

    Fingerprint(hasher.finalize().into())
}

/// Lowercase the host and drop an explicit default port
fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match host.strip_suffix(":80").or_else(|| host.strip_suffix(":443")) {
        Some(bare) => bare.to_string(),
        None => host,
    }
}

/// Normalize a URL path
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();

    if trimmed.is_empty() || !trimmed.starts_with('/') {
        format!("/{trimmed}")
    } else {
        trimmed.to_string()
    }
}
