//! HTTP/1.x message framing on raw streams
//!
//! Messages are read whole and kept byte-for-byte, so a tunnel can forward
//! exactly what each side sent.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::LimitsConfig;
use crate::{ProxyError, Result};

/// Size limits applied while reading messages
#[derive(Debug, Clone, Copy)]
pub struct WireLimits {
    /// Request line/status line plus headers
    pub max_head_size: usize,
    /// Header count
    pub max_headers: usize,
    /// Request body
    pub max_request_body: usize,
    /// Response body
    pub max_response_body: usize,
}

impl From<&LimitsConfig> for WireLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_head_size: limits.max_head_size,
            max_headers: limits.max_headers,
            max_request_body: limits.max_request_size,
            max_response_body: limits.max_response_size,
        }
    }
}

impl Default for WireLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

/// A request exactly as received
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// Request method
    pub method: String,
    /// Head and body bytes
    pub bytes: Vec<u8>,
    /// Sender asked to close the connection after this exchange
    pub close: bool,
}

/// A response exactly as received, interim responses included
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Final status code
    pub status: u16,
    /// Head and body bytes
    pub bytes: Vec<u8>,
    /// Connection cannot carry another exchange
    pub close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Default)]
struct HeaderInfo {
    content_length: Option<u64>,
    chunked: bool,
    close: bool,
}

/// Read one request, `Ok(None)` if the peer closed before sending any byte
///
/// # Errors
///
/// Returns error on I/O failure, malformed framing, or exceeded limits
pub async fn read_request<R>(reader: &mut R, limits: &WireLimits) -> Result<Option<RawRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(mut bytes) = read_head(reader, limits.max_head_size).await? else {
        return Ok(None);
    };

    let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed
        .parse(&bytes)
        .map_err(|e| malformed(format!("request head: {e}")))?;
    if status.is_partial() {
        return Err(malformed("incomplete request head"));
    }

    let method = parsed.method.unwrap_or_default().to_string();
    let info = scan_headers(parsed.headers, parsed.version.unwrap_or(1))?;

    let framing = if info.chunked {
        Framing::Chunked
    } else if let Some(length) = info.content_length {
        Framing::Length(length)
    } else {
        Framing::Empty
    };

    read_body(reader, framing, limits.max_request_body, limits.max_head_size, &mut bytes).await?;

    Ok(Some(RawRequest {
        method,
        bytes,
        close: info.close,
    }))
}

/// Read the response to a request sent with `request_method`
///
/// Interim `1xx` responses are kept in front of the final one.
///
/// # Errors
///
/// Returns error on I/O failure, malformed framing, or exceeded limits
pub async fn read_response<R>(
    reader: &mut R,
    request_method: &str,
    limits: &WireLimits,
) -> Result<RawResponse>
where
    R: AsyncBufRead + Unpin,
{
    let mut bytes = Vec::new();

    loop {
        // Interim heads count against the same head budget as the final one.
        let head = read_head(reader, limits.max_head_size.saturating_sub(bytes.len()))
            .await?
            .ok_or_else(|| malformed("connection closed before response"))?;

        let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
        let mut parsed = httparse::Response::new(&mut headers);
        let status = parsed
            .parse(&head)
            .map_err(|e| malformed(format!("response head: {e}")))?;
        if status.is_partial() {
            return Err(malformed("incomplete response head"));
        }

        let code = parsed.code.unwrap_or_default();
        let info = scan_headers(parsed.headers, parsed.version.unwrap_or(1))?;
        bytes.extend_from_slice(&head);

        if (100..200).contains(&code) && code != 101 {
            continue;
        }

        // A 2xx to CONNECT turns the connection into a tunnel.
        let framing = if request_method.eq_ignore_ascii_case("HEAD")
            || (request_method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&code))
            || (100..200).contains(&code)
            || code == 204
            || code == 304
        {
            Framing::Empty
        } else if info.chunked {
            Framing::Chunked
        } else if let Some(length) = info.content_length {
            Framing::Length(length)
        } else {
            Framing::UntilClose
        };

        read_body(
            reader,
            framing,
            limits.max_response_body,
            limits.max_head_size,
            &mut bytes,
        )
        .await?;

        return Ok(RawResponse {
            status: code,
            bytes,
            close: info.close || code == 101 || framing == Framing::UntilClose,
        });
    }
}

/// Read up to and including the blank line ending a message head
///
/// No more than `max_size` bytes are buffered, stray line breaks included.
async fn read_head<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    let mut skipped = 0usize;

    loop {
        let budget = max_size.saturating_sub(head.len() + skipped);
        let read = read_line(reader, &mut head, budget).await?;
        if read == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(malformed("connection closed inside message head"));
        }

        if head.len() + skipped > max_size {
            return Err(ProxyError::DataTooLarge {
                size: head.len() + skipped,
                limit: max_size,
            });
        }

        // Stray line breaks between messages are ignored.
        if head == b"\r\n" || head == b"\n" {
            skipped += head.len();
            head.clear();
            continue;
        }

        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(Some(head));
        }
    }
}

/// Append one line to `out`, reading at most `budget + 1` bytes
///
/// A line longer than `budget` comes back without its newline, which callers
/// detect by the length they end up holding.
async fn read_line<R>(reader: &mut R, out: &mut Vec<u8>, budget: usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let cap = u64::try_from(budget).unwrap_or(u64::MAX).saturating_add(1);
    Ok((&mut *reader).take(cap).read_until(b'\n', out).await?)
}

fn scan_headers(headers: &[httparse::Header<'_>], version: u8) -> Result<HeaderInfo> {
    // HTTP/1.0 closes by default.
    let mut info = HeaderInfo {
        close: version == 0,
        ..HeaderInfo::default()
    };

    for header in headers {
        let value = String::from_utf8_lossy(header.value);

        if header.name.eq_ignore_ascii_case("content-length") {
            let length = value
                .trim()
                .parse::<u64>()
                .map_err(|_| malformed(format!("invalid Content-Length {value:?}")))?;
            if info.content_length.is_some_and(|previous| previous != length) {
                return Err(malformed("conflicting Content-Length headers"));
            }
            info.content_length = Some(length);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            info.chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        } else if header.name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    info.close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") && version == 0 {
                    info.close = false;
                }
            }
        }
    }

    Ok(info)
}

async fn read_body<R>(
    reader: &mut R,
    framing: Framing,
    limit: usize,
    line_limit: usize,
    out: &mut Vec<u8>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        Framing::Empty => Ok(()),
        Framing::Length(length) => {
            let length = usize::try_from(length)
                .ok()
                .filter(|length| *length <= limit)
                .ok_or(ProxyError::DataTooLarge {
                    size: usize::try_from(length).unwrap_or(usize::MAX),
                    limit,
                })?;

            let start = out.len();
            out.resize(start + length, 0);
            reader.read_exact(&mut out[start..]).await?;
            Ok(())
        }
        Framing::Chunked => read_chunked(reader, limit, line_limit, out).await,
        Framing::UntilClose => {
            let start = out.len();
            let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
            (&mut *reader).take(cap).read_to_end(out).await?;

            let size = out.len() - start;
            if size > limit {
                return Err(ProxyError::DataTooLarge { size, limit });
            }
            Ok(())
        }
    }
}

async fn read_chunked<R>(
    reader: &mut R,
    limit: usize,
    line_limit: usize,
    out: &mut Vec<u8>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;

    loop {
        let line_start = out.len();
        if read_line(reader, out, line_limit).await? == 0 {
            return Err(malformed("connection closed inside chunked body"));
        }
        if !out.ends_with(b"\n") {
            return Err(ProxyError::DataTooLarge {
                size: out.len() - line_start,
                limit: line_limit,
            });
        }
        let size = parse_chunk_size(&out[line_start..])?;

        if size == 0 {
            // Trailer section ends with an empty line.
            let trailer_start = out.len();
            loop {
                let used = out.len() - trailer_start;
                let start = out.len();
                if read_line(reader, out, line_limit.saturating_sub(used)).await? == 0 {
                    return Err(malformed("connection closed inside chunk trailer"));
                }
                if out.len() - trailer_start > line_limit {
                    return Err(ProxyError::DataTooLarge {
                        size: out.len() - trailer_start,
                        limit: line_limit,
                    });
                }
                let line = &out[start..];
                if line == b"\r\n" || line == b"\n" {
                    return Ok(());
                }
            }
        }

        total = total.saturating_add(size);
        if total > limit {
            return Err(ProxyError::DataTooLarge { size: total, limit });
        }

        let start = out.len();
        out.resize(start + size + 2, 0);
        reader.read_exact(&mut out[start..]).await?;
        if !out.ends_with(b"\r\n") {
            return Err(malformed("chunk not terminated by CRLF"));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let line = String::from_utf8_lossy(line);
    let size = line.split(';').next().unwrap_or_default().trim();

    usize::from_str_radix(size, 16).map_err(|_| malformed(format!("invalid chunk size {size:?}")))
}

fn malformed(message: impl Into<String>) -> ProxyError {
    ProxyError::MalformedMessage(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn request_from(data: &[u8]) -> Result<Option<RawRequest>> {
        let mut reader = BufReader::new(data);
        read_request(&mut reader, &WireLimits::default()).await
    }

    async fn response_from(data: &[u8], method: &str) -> Result<RawResponse> {
        let mut reader = BufReader::new(data);
        read_response(&mut reader, method, &WireLimits::default()).await
    }

    #[tokio::test]
    async fn test_request_without_body() {
        let data = b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let request = request_from(data).await.unwrap().unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.bytes, data.to_vec());
        assert!(!request.close);
    }

    #[tokio::test]
    async fn test_request_with_length_body_is_verbatim() {
        let data = b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhelloGET";
        let request = request_from(data).await.unwrap().unwrap();

        assert_eq!(request.bytes, data[..data.len() - 3].to_vec());
    }

    #[tokio::test]
    async fn test_pipelined_requests_are_split() {
        let data = b"GET /1 HTTP/1.1\r\nHost: x\r\n\r\nGET /2 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        let mut reader = BufReader::new(&data[..]);
        let limits = WireLimits::default();

        let first = read_request(&mut reader, &limits).await.unwrap().unwrap();
        let second = read_request(&mut reader, &limits).await.unwrap().unwrap();
        let end = read_request(&mut reader, &limits).await.unwrap();

        assert!(first.bytes.starts_with(b"GET /1"));
        assert!(second.bytes.starts_with(b"GET /2"));
        assert!(second.close);
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        assert!(request_from(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_head_is_error() {
        assert!(request_from(b"GET / HTTP/1.1\r\nHost").await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_request_is_malformed() {
        let result = request_from(b"NOT HTTP\r\n\r\n").await;
        assert!(matches!(result, Err(ProxyError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_http10_request_closes() {
        let request = request_from(b"GET / HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert!(request.close);
    }

    #[tokio::test]
    async fn test_chunked_response_is_verbatim() {
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n3;ext=1\r\n!!!\r\n0\r\nX-Trailer: y\r\n\r\n";
        let response = response_from(data, "GET").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.bytes, data.to_vec());
        assert!(!response.close);
    }

    #[tokio::test]
    async fn test_response_to_head_has_no_body() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let response = response_from(data, "HEAD").await.unwrap();

        assert_eq!(response.bytes, data.to_vec());
    }

    #[tokio::test]
    async fn test_connect_established_has_no_body() {
        let data = b"HTTP/1.1 200 OK\r\ndate: Mon, 19 Oct 2026 10:00:00 GMT\r\n\r\n";
        let response = response_from(data, "CONNECT").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.bytes, data.to_vec());
    }

    #[tokio::test]
    async fn test_response_until_close() {
        let data = b"HTTP/1.1 200 OK\r\n\r\nstreamed body";
        let response = response_from(data, "GET").await.unwrap();

        assert_eq!(response.bytes, data.to_vec());
        assert!(response.close);
    }

    #[tokio::test]
    async fn test_interim_response_kept() {
        let data = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let response = response_from(data, "POST").await.unwrap();

        assert_eq!(response.status, 204);
        assert_eq!(response.bytes, data.to_vec());
    }

    #[tokio::test]
    async fn test_conflicting_lengths_rejected() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab";
        assert!(response_from(data, "GET").await.is_err());
    }

    #[tokio::test]
    async fn test_body_limit_enforced() {
        let limits = WireLimits {
            max_response_body: 4,
            ..WireLimits::default()
        };
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut reader = BufReader::new(&data[..]);

        let result = read_response(&mut reader, "GET", &limits).await;
        assert!(matches!(result, Err(ProxyError::DataTooLarge { limit: 4, .. })));
    }

    #[tokio::test]
    async fn test_endless_head_line_is_bounded() {
        let limits = WireLimits {
            max_head_size: 1024,
            ..WireLimits::default()
        };
        let mut reader = BufReader::new(tokio::io::repeat(b'A'));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            read_request(&mut reader, &limits),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProxyError::DataTooLarge { limit: 1024, .. })));
    }

    #[tokio::test]
    async fn test_endless_line_breaks_are_bounded() {
        let limits = WireLimits {
            max_head_size: 64,
            ..WireLimits::default()
        };
        let mut reader = BufReader::new(tokio::io::repeat(b'\n'));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            read_request(&mut reader, &limits),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProxyError::DataTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_endless_chunk_size_line_is_bounded() {
        let limits = WireLimits {
            max_head_size: 256,
            ..WireLimits::default()
        };
        let head: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut reader = BufReader::new(head.chain(tokio::io::repeat(b'1')));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            read_response(&mut reader, "GET", &limits),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProxyError::DataTooLarge { limit: 256, .. })));
    }

    #[tokio::test]
    async fn test_endless_trailer_is_bounded() {
        let limits = WireLimits {
            max_head_size: 256,
            ..WireLimits::default()
        };
        let head: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n";
        let mut reader = BufReader::new(head.chain(tokio::io::repeat(b'x')));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            read_response(&mut reader, "GET", &limits),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProxyError::DataTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_interim_heads_share_head_budget() {
        let limits = WireLimits {
            max_head_size: 100,
            ..WireLimits::default()
        };
        let interim: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
        let mut reader = BufReader::new(interim.chain(interim).chain(interim).chain(interim).chain(interim));

        let result = read_response(&mut reader, "POST", &limits).await;
        assert!(matches!(result, Err(ProxyError::DataTooLarge { .. })));
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"0\r\n").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"5;name=v\r\n").unwrap(), 5);
        assert!(parse_chunk_size(b"zz\r\n").is_err());
    }
}
