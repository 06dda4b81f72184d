//! Server-Sent Events over the fingerprinted dial.
//!
//! A plain GET with `Accept: text/event-stream`, then an incremental
//! parser over the response body delivering one event per call. Field
//! handling follows the EventSource processing model: `event:`, `data:`,
//! `id:`, `retry:`, comment lines ignored, multi-line data joined with
//! newlines, an empty line dispatches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::spec::TransportSpec;
use crate::request::DEFAULT_JA3;
use crate::tls::handshake::DialTarget;
use crate::transport::connector::{self, MaybeTlsStream};
use crate::transport::proxy::ProxyConfig;

/// Options for one SSE connection.
#[derive(Debug, Clone, Default)]
pub struct SseOptions {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub ja3: Option<String>,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

/// One parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; "message" when the stream did not name one.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Incremental EventSource field parser.
#[derive(Debug, Default)]
pub struct EventParser {
    data: Vec<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator). An empty line dispatches
    /// the accumulated event, if any.
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(rest) = line.strip_prefix(':') {
            let _ = rest; // comment line
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            // Nothing accumulated; blank line is a no-op.
            self.retry = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: self.data.join("\n"),
            id: self.id.clone(),
            retry: self.retry.take(),
        };
        self.data.clear();
        Some(event)
    }
}

/// Chunked transfer decoding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Expecting a chunk-size line.
    Size,
    /// Inside a chunk payload with this many bytes left.
    Data(usize),
    /// Expecting the CRLF after a chunk payload.
    TrailingCrlf,
}

/// A live SSE stream.
pub struct SseConnection {
    stream: MaybeTlsStream,
    parser: EventParser,
    /// Undecoded transport bytes (chunk framing included).
    raw: Vec<u8>,
    /// Decoded body bytes awaiting line splitting.
    lines: Vec<u8>,
    chunked: bool,
    chunk_state: ChunkState,
    eof: bool,
}

impl std::fmt::Debug for SseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnection").finish_non_exhaustive()
    }
}

impl SseConnection {
    /// Dial, send the GET, and validate the stream response.
    pub async fn connect(options: &SseOptions) -> Result<Self> {
        let deadline = if options.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            options.timeout
        };
        match timeout(deadline, Self::connect_inner(options)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("sse connect")),
        }
    }

    async fn connect_inner(options: &SseOptions) -> Result<Self> {
        let url = Url::parse(&options.url)?;
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(Error::connection(format!("unsupported scheme {scheme:?}")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::connection("URL missing host"))?
            .to_string();
        let default_port: u16 = if scheme == "https" { 443 } else { 80 };
        let port = url.port().unwrap_or(default_port);

        let ja3 = options.ja3.as_deref().unwrap_or(DEFAULT_JA3);
        let mut spec = TransportSpec::resolve(Some(ja3), None, None, None, false)?;
        spec.alpn = vec!["http/1.1".to_string()];

        let proxy = match options.proxy.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(ProxyConfig::parse(raw)?),
            None => None,
        };

        let target = DialTarget {
            host: host.clone(),
            port,
            server_name: None,
            insecure_skip_verify: false,
            proxy,
        };
        let dialed = connector::connect(scheme, &target, &spec, true, false).await?;
        let mut stream = dialed.stream;

        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let mut request = format!("GET {path} HTTP/1.1\r\nHost: {host}");
        if port != default_port {
            request.push_str(&format!(":{port}"));
        }
        request.push_str("\r\nAccept: text/event-stream\r\nCache-Control: no-cache\r\n");
        if let Some(ua) = &options.user_agent {
            request.push_str(&format!("User-Agent: {ua}\r\n"));
        }
        for (name, value) in &options.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("accept") {
                continue;
            }
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::protocol(format!("sse request write: {e}")))?;

        // Read the response head.
        let mut head = Vec::with_capacity(1024);
        let mut pending = Vec::new();
        let mut chunk = [0u8; 2048];
        let head_end = loop {
            if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if head.len() > 64 * 1024 {
                return Err(Error::protocol("sse response head too large"));
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::protocol(format!("sse response read: {e}")))?;
            if n == 0 {
                return Err(Error::protocol("connection closed before sse response"));
            }
            head.extend_from_slice(&chunk[..n]);
        };
        pending.extend_from_slice(&head[head_end..]);
        head.truncate(head_end);

        let head_text = String::from_utf8_lossy(&head);
        let status = head_text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .unwrap_or(0);
        if status != 200 {
            return Err(Error::protocol(format!("sse request refused with status {status}")));
        }

        let chunked = head_text.lines().any(|line| {
            line.split_once(':').is_some_and(|(name, value)| {
                name.trim().eq_ignore_ascii_case("transfer-encoding")
                    && value.to_ascii_lowercase().contains("chunked")
            })
        });

        Ok(Self {
            stream,
            parser: EventParser::new(),
            raw: pending,
            lines: Vec::new(),
            chunked,
            chunk_state: ChunkState::Size,
            eof: false,
        })
    }

    /// Next event, or None when the stream ended.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            // Drain complete lines already decoded.
            while let Some(pos) = self.lines.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.lines.drain(..=pos).collect();
                line.pop();
                if line.ends_with(b"\r") {
                    line.pop();
                }
                let line = String::from_utf8_lossy(&line).into_owned();
                if let Some(event) = self.parser.push_line(&line) {
                    return Ok(Some(event));
                }
            }

            self.decode_raw()?;
            if !self.lines.contains(&b'\n') {
                if self.eof {
                    return Ok(None);
                }
                self.read_more().await?;
                self.decode_raw()?;
            }
            if self.eof && !self.lines.contains(&b'\n') && self.raw.is_empty() {
                return Ok(None);
            }
        }
    }

    async fn read_more(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::protocol(format!("sse read: {e}")))?;
        if n == 0 {
            self.eof = true;
        } else {
            self.raw.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Move decoded body bytes from the transport buffer to the line
    /// buffer; chunk framing never reaches the parser.
    fn decode_raw(&mut self) -> Result<()> {
        if !self.chunked {
            self.lines.append(&mut self.raw);
            return Ok(());
        }

        loop {
            match self.chunk_state {
                ChunkState::Size => {
                    let Some(pos) = self.raw.windows(2).position(|w| w == b"\r\n") else {
                        return Ok(());
                    };
                    let line: Vec<u8> = self.raw.drain(..pos + 2).take(pos).collect();
                    let text = String::from_utf8_lossy(&line);
                    let size_str = text.split(';').next().unwrap_or("").trim();
                    if size_str.is_empty() {
                        continue;
                    }
                    let size = usize::from_str_radix(size_str, 16).map_err(|_| {
                        Error::protocol(format!("invalid chunk size {size_str:?}"))
                    })?;
                    if size == 0 {
                        self.eof = true;
                        return Ok(());
                    }
                    self.chunk_state = ChunkState::Data(size);
                }
                ChunkState::Data(remaining) => {
                    if self.raw.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.raw.len());
                    self.lines.extend(self.raw.drain(..take));
                    if take == remaining {
                        self.chunk_state = ChunkState::TrailingCrlf;
                    } else {
                        self.chunk_state = ChunkState::Data(remaining - take);
                    }
                }
                ChunkState::TrailingCrlf => {
                    if self.raw.len() < 2 {
                        return Ok(());
                    }
                    self.raw.drain(..2);
                    self.chunk_state = ChunkState::Size;
                }
            }
        }
    }
}

/// Handle registry for the boundary layer.
#[derive(Clone, Default)]
pub struct SseRegistry {
    connections: Arc<DashMap<u64, Arc<Mutex<SseConnection>>>>,
    next_handle: Arc<AtomicU64>,
}

impl SseRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Connect and register; returns 0 on failure.
    pub async fn connect(&self, options: &SseOptions) -> u64 {
        match SseConnection::connect(options).await {
            Ok(connection) => {
                let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                self.connections
                    .insert(handle, Arc::new(Mutex::new(connection)));
                handle
            }
            Err(e) => {
                tracing::debug!("sse connect failed: {e}");
                0
            }
        }
    }

    /// Next event from a registered stream; Ok(None) signals end of
    /// stream.
    pub async fn next_event(&self, handle: u64) -> Result<Option<SseEvent>> {
        let connection = self
            .connections
            .get(&handle)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::protocol(format!("unknown sse handle {handle}")))?;
        let mut guard = connection.lock().await;
        guard.next_event().await
    }

    pub async fn close(&self, handle: u64) {
        self.connections.remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
