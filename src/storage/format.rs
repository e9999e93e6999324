//! Binary layout of stored records
//!
//! ```text
//! magic "GPXR" | version u16 | crc32 u32 | payload
//! payload = fingerprint [32] | status u16 | header count u16
//!           | (name len u16, name, value len u32, value)* | body len u32 | body
//! ```
//!
//! All integers are little-endian. The CRC covers the payload only.

use crc32fast::Hasher;

use super::{StoredRecord, StoredResponse};
use crate::fingerprint::Fingerprint;
use crate::{ProxyError, Result};

/// Record magic bytes
pub const RECORD_MAGIC: [u8; 4] = *b"GPXR";

/// Current record version
pub const RECORD_VERSION: u16 = 1;

/// Bytes before the payload: magic, version, crc
const PREAMBLE_SIZE: usize = 4 + 2 + 4;

/// Serialize a record for the store
///
/// # Errors
///
/// Returns `DataTooLarge` if a field does not fit its length prefix
pub fn encode_record(fingerprint: &Fingerprint, response: &StoredResponse) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(64 + response.body.len());

    payload.extend_from_slice(fingerprint.as_bytes());
    payload.extend_from_slice(&response.status.to_le_bytes());

    let header_count = checked_len::<u16>(response.headers.len())?;
    payload.extend_from_slice(&header_count.to_le_bytes());

    for (name, value) in &response.headers {
        let name_len = checked_len::<u16>(name.len())?;
        payload.extend_from_slice(&name_len.to_le_bytes());
        payload.extend_from_slice(name.as_bytes());

        let value_len = checked_len::<u32>(value.len())?;
        payload.extend_from_slice(&value_len.to_le_bytes());
        payload.extend_from_slice(value);
    }

    let body_len = checked_len::<u32>(response.body.len())?;
    payload.extend_from_slice(&body_len.to_le_bytes());
    payload.extend_from_slice(&response.body);

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut data = Vec::with_capacity(PREAMBLE_SIZE + payload.len());
    data.extend_from_slice(&RECORD_MAGIC);
    data.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    data.extend_from_slice(&crc.to_le_bytes());
    data.extend_from_slice(&payload);

    Ok(data)
}

/// Deserialize a record read from the store
///
/// # Errors
///
/// Returns `InvalidFormat` for a bad magic, version or truncated field, and
/// `CorruptedData` when the checksum does not match
pub fn decode_record(data: &[u8]) -> Result<StoredRecord> {
    let mut reader = FieldReader::new(data);

    if reader.take(4, "magic")? != RECORD_MAGIC {
        return Err(ProxyError::InvalidFormat("Invalid magic bytes".to_string()));
    }

    let version = reader.u16("version")?;
    if version != RECORD_VERSION {
        return Err(ProxyError::InvalidFormat(format!(
            "Unsupported version: {version}, expected {RECORD_VERSION}"
        )));
    }

    let expected = reader.u32("checksum")?;
    let mut hasher = Hasher::new();
    hasher.update(reader.remaining());
    let actual = hasher.finalize();
    if expected != actual {
        return Err(ProxyError::CorruptedData { expected, actual });
    }

    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(reader.take(32, "fingerprint")?);

    let status = reader.u16("status")?;
    let header_count = reader.u16("header count")?;

    let mut headers = Vec::with_capacity(usize::from(header_count));
    for _ in 0..header_count {
        let name_len = usize::from(reader.u16("header name length")?);
        let name = std::str::from_utf8(reader.take(name_len, "header name")?)
            .map_err(|e| ProxyError::InvalidFormat(format!("Header name not UTF-8: {e}")))?
            .to_string();

        let value_len = reader.u32("header value length")? as usize;
        let value = reader.take(value_len, "header value")?.to_vec();

        headers.push((name, value));
    }

    let body_len = reader.u32("body length")? as usize;
    let body = reader.take(body_len, "body")?.to_vec();

    if !reader.remaining().is_empty() {
        return Err(ProxyError::InvalidFormat(format!(
            "{} trailing bytes after body",
            reader.remaining().len()
        )));
    }

    Ok(StoredRecord {
        fingerprint: Fingerprint::from_bytes(fingerprint),
        response: StoredResponse {
            status,
            headers,
            body,
        },
    })
}

fn checked_len<T: TryFrom<usize>>(len: usize) -> Result<T> {
    T::try_from(len).map_err(|_| ProxyError::DataTooLarge {
        size: len,
        limit: std::mem::size_of::<T>() * 8,
    })
}

/// Bounds-checked cursor over a record
struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ProxyError::InvalidFormat(format!("Missing {field}")))?;

        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u16(&mut self, field: &str) -> Result<u16> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}
