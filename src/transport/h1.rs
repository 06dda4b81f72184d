//! HTTP/1.1 over the fingerprinted stream.
//!
//! The request is written byte-by-byte so header order stays exactly as the
//! executor resolved it; responses are parsed with httparse.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::response::Response;
use crate::version::HttpVersion;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 100;
const READ_CHUNK: usize = 8192;

/// A single HTTP/1.1 connection.
pub struct H1Connection<S> {
    stream: S,
    /// Set when the response demands the connection not be reused.
    must_close: bool,
}

impl<S> H1Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            must_close: false,
        }
    }

    /// Whether the connection can go back to the pool.
    pub fn reusable(&self) -> bool {
        !self.must_close
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Write one request and read its response.
    pub async fn send_request(
        &mut self,
        method: &str,
        host: &str,
        port: u16,
        default_port: u16,
        path: &str,
        headers: &[(String, String)],
        body: Option<&Bytes>,
    ) -> Result<Response> {
        let wire = build_request(method, host, port, default_port, path, headers, body);
        self.stream
            .write_all(&wire)
            .await
            .map_err(|e| Error::protocol(format!("write request: {e}")))?;
        if let Some(body) = body {
            self.stream
                .write_all(body)
                .await
                .map_err(|e| Error::protocol(format!("write body: {e}")))?;
        }
        self.stream
            .flush()
            .await
            .map_err(|e| Error::protocol(format!("flush: {e}")))?;

        self.read_response(method).await
    }

    async fn read_response(&mut self, method: &str) -> Result<Response> {
        let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);

        loop {
            // Accumulate until the header terminator shows up.
            let header_end = loop {
                if let Some(end) = find_header_end(&buffer) {
                    break end;
                }
                if buffer.len() >= MAX_HEADER_BYTES {
                    return Err(Error::protocol("response headers too large"));
                }
                let mut chunk = [0u8; READ_CHUNK];
                let n = self
                    .stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| Error::protocol(format!("read response: {e}")))?;
                if n == 0 {
                    return Err(Error::protocol("connection closed before response"));
                }
                buffer.extend_from_slice(&chunk[..n]);
            };

            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
            let mut parsed = httparse::Response::new(&mut header_storage);
            parsed
                .parse(&buffer)
                .map_err(|e| Error::protocol(format!("parse response: {e}")))?;

            let status = parsed
                .code
                .ok_or_else(|| Error::protocol("response missing status"))?;
            let headers: Vec<(String, String)> = parsed
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();

            // 1xx responses carry no body and precede the real one.
            if (100..200).contains(&status) {
                buffer.drain(..header_end);
                continue;
            }

            let body = self
                .read_body(method, status, &headers, buffer.split_off(header_end))
                .await?;

            if connection_close(&headers) {
                self.must_close = true;
            }

            return Ok(Response::new(status, headers, Bytes::from(body), HttpVersion::Http1));
        }
    }

    async fn read_body(
        &mut self,
        method: &str,
        status: u16,
        headers: &[(String, String)],
        mut pending: Vec<u8>,
    ) -> Result<Vec<u8>> {
        if method.eq_ignore_ascii_case("HEAD") || status == 204 || status == 304 {
            return Ok(Vec::new());
        }

        if header_value(headers, "transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return self.read_chunked(pending).await;
        }

        if let Some(length) = header_value(headers, "content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            while pending.len() < length {
                let mut chunk = [0u8; READ_CHUNK];
                let n = self
                    .stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| Error::protocol(format!("read body: {e}")))?;
                if n == 0 {
                    return Err(Error::protocol("connection closed mid-body"));
                }
                pending.extend_from_slice(&chunk[..n]);
            }
            pending.truncate(length);
            return Ok(pending);
        }

        // No framing: body runs to connection close.
        self.must_close = true;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::protocol(format!("read body: {e}")))?;
            if n == 0 {
                return Ok(pending);
            }
            pending.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_chunked(&mut self, pending: Vec<u8>) -> Result<Vec<u8>> {
        let mut raw = pending;
        let mut body = Vec::new();
        let mut offset = 0;

        loop {
            // Chunk-size line.
            let line_end = loop {
                if let Some(pos) = find_crlf(&raw[offset..]) {
                    break offset + pos;
                }
                self.fill(&mut raw).await?;
            };
            let size_str = std::str::from_utf8(&raw[offset..line_end])
                .map_err(|_| Error::protocol("invalid chunk size"))?;
            let size_str = size_str.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| Error::protocol(format!("invalid chunk size {size_str:?}")))?;
            offset = line_end + 2;

            if size == 0 {
                // Trailer section runs to a blank line; drain it.
                loop {
                    if let Some(pos) = find_crlf(&raw[offset..]) {
                        if pos == 0 {
                            return Ok(body);
                        }
                        offset += pos + 2;
                    } else {
                        self.fill(&mut raw).await?;
                    }
                }
            }

            while raw.len() < offset + size + 2 {
                self.fill(&mut raw).await?;
            }
            body.extend_from_slice(&raw[offset..offset + size]);
            offset += size + 2;
        }
    }

    async fn fill(&mut self, raw: &mut Vec<u8>) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::protocol(format!("read body: {e}")))?;
        if n == 0 {
            return Err(Error::protocol("connection closed mid-chunk"));
        }
        raw.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// Serialize the request head. Host is written first, then the caller's
/// headers exactly as ordered, then framing headers the caller omitted.
fn build_request(
    method: &str,
    host: &str,
    port: u16,
    default_port: u16,
    path: &str,
    headers: &[(String, String)],
    body: Option<&Bytes>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(if path.is_empty() { b"/" } else { path.as_bytes() });
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let user_host = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host"));
    if !user_host {
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(host.as_bytes());
        if port != default_port {
            out.push(b':');
            out.extend_from_slice(port.to_string().as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }

    let mut has_connection = false;
    let mut has_length = false;
    let mut has_transfer = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            has_connection = true;
        }
        if name.eq_ignore_ascii_case("content-length") {
            has_length = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            has_transfer = true;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !has_connection {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    }
    if let Some(body) = body {
        if !has_length && !has_transfer {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(body.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b"\r\n");
    out
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn connection_close(headers: &[(String, String)]) -> bool {
    header_value(headers, "connection").is_some_and(|v| v.eq_ignore_ascii_case("close"))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
