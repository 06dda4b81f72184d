//! WebSocket upgrade path over the fingerprinted TLS dial.
//!
//! The RFC 6455 client handshake is written over the same dialed stream
//! the HTTP paths use, so the TLS identity is identical; the established
//! connection is handed to fastwebsockets for the frame loop and leaves
//! the HTTP pool entirely.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use fastwebsockets::{Frame, OpCode, Payload, Role, WebSocket};
use getrandom::getrandom;
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
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

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Options for one WebSocket connection.
#[derive(Debug, Clone, Default)]
pub struct WsOptions {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub ja3: Option<String>,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

/// Message opcodes as they cross the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOpcode {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl WsOpcode {
    /// Boundary numbering follows the RFC 6455 opcode values.
    pub fn code(&self) -> u8 {
        match self {
            Self::Text => 1,
            Self::Binary => 2,
            Self::Close => 8,
            Self::Ping => 9,
            Self::Pong => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            8 => Some(Self::Close),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A live WebSocket connection.
pub struct WsConnection {
    socket: WebSocket<MaybeTlsStream>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection").finish_non_exhaustive()
    }
}

impl WsConnection {
    /// Dial and upgrade.
    pub async fn connect(options: &WsOptions) -> Result<Self> {
        let deadline = if options.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            options.timeout
        };
        match timeout(deadline, Self::connect_inner(options)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("websocket connect")),
        }
    }

    async fn connect_inner(options: &WsOptions) -> Result<Self> {
        let url = Url::parse(&options.url)?;
        let (scheme, default_port) = match url.scheme() {
            "wss" | "https" => ("https", 443),
            "ws" | "http" => ("http", 80),
            other => return Err(Error::connection(format!("unsupported scheme {other:?}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::connection("URL missing host"))?
            .to_string();
        let port = url.port().unwrap_or(default_port);

        let ja3 = options.ja3.as_deref().unwrap_or(DEFAULT_JA3);
        let mut spec = TransportSpec::resolve(Some(ja3), None, None, None, false)?;
        // The upgrade request is HTTP/1.1; h2 must not be offered.
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

        // RFC 6455 opening handshake.
        let mut key_bytes = [0u8; 16];
        getrandom(&mut key_bytes).map_err(|e| Error::protocol(format!("ws key rng: {e}")))?;
        let key = BASE64.encode(key_bytes);

        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let mut request = format!("GET {path} HTTP/1.1\r\nHost: {host}");
        if port != default_port {
            request.push_str(&format!(":{port}"));
        }
        request.push_str("\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n");
        request.push_str(&format!("Sec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n"));
        if let Some(ua) = &options.user_agent {
            request.push_str(&format!("User-Agent: {ua}\r\n"));
        }
        for (name, value) in &options.headers {
            if matches!(
                name.to_ascii_lowercase().as_str(),
                "host" | "upgrade" | "connection" | "sec-websocket-key" | "sec-websocket-version"
            ) {
                continue;
            }
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::protocol(format!("ws handshake write: {e}")))?;

        // Read the 101 response head.
        let mut head = Vec::with_capacity(1024);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > 16 * 1024 {
                return Err(Error::protocol("ws handshake response too large"));
            }
            let n = stream
                .read(&mut byte)
                .await
                .map_err(|e| Error::protocol(format!("ws handshake read: {e}")))?;
            if n == 0 {
                return Err(Error::protocol("connection closed during ws handshake"));
            }
            head.push(byte[0]);
        }

        let head_text = String::from_utf8_lossy(&head);
        let status = head_text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .unwrap_or(0);
        if status != 101 {
            return Err(Error::protocol(format!("ws upgrade refused with status {status}")));
        }

        let accept = head_text
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("sec-websocket-accept")
                    .then(|| value.trim().to_string())
            })
            .ok_or_else(|| Error::protocol("missing Sec-WebSocket-Accept"))?;
        let expected = BASE64.encode(Sha1::digest(format!("{key}{WS_GUID}").as_bytes()));
        if accept != expected {
            return Err(Error::protocol("Sec-WebSocket-Accept mismatch"));
        }

        let mut socket = WebSocket::after_handshake(stream, Role::Client);
        socket.set_auto_close(true);
        socket.set_auto_pong(false);

        Ok(Self { socket })
    }

    /// Send one message with the given opcode.
    pub async fn send(&mut self, opcode: WsOpcode, payload: Bytes) -> Result<()> {
        let data = Payload::Owned(payload.to_vec());
        let frame = match opcode {
            WsOpcode::Text => Frame::text(data),
            WsOpcode::Binary => Frame::binary(data),
            WsOpcode::Ping => Frame::new(true, OpCode::Ping, None, data),
            WsOpcode::Pong => Frame::pong(data),
            WsOpcode::Close => Frame::close(1000, &payload),
        };
        self.socket
            .write_frame(frame)
            .await
            .map_err(|e| Error::protocol(format!("ws send: {e}")))
    }

    /// Receive the next message; returns its opcode and payload.
    pub async fn receive(&mut self) -> Result<(WsOpcode, Bytes)> {
        let frame = self
            .socket
            .read_frame()
            .await
            .map_err(|e| Error::protocol(format!("ws receive: {e}")))?;
        let opcode = match frame.opcode {
            OpCode::Text => WsOpcode::Text,
            OpCode::Binary | OpCode::Continuation => WsOpcode::Binary,
            OpCode::Ping => WsOpcode::Ping,
            OpCode::Pong => WsOpcode::Pong,
            OpCode::Close => WsOpcode::Close,
        };
        Ok((opcode, Bytes::copy_from_slice(&frame.payload)))
    }

    /// Send a normal close and drop the connection.
    pub async fn close(mut self) {
        let _ = self
            .socket
            .write_frame(Frame::close(1000, b""))
            .await;
    }
}

/// Handle registry for the boundary layer.
#[derive(Clone, Default)]
pub struct WsRegistry {
    connections: Arc<DashMap<u64, Arc<Mutex<WsConnection>>>>,
    next_handle: Arc<AtomicU64>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Connect and register; returns 0 on failure (matching the boundary
    /// convention for unusable handles).
    pub async fn connect(&self, options: &WsOptions) -> u64 {
        match WsConnection::connect(options).await {
            Ok(connection) => {
                let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                self.connections
                    .insert(handle, Arc::new(Mutex::new(connection)));
                handle
            }
            Err(e) => {
                tracing::debug!("ws connect failed: {e}");
                0
            }
        }
    }

    pub async fn send(&self, handle: u64, opcode: WsOpcode, payload: Bytes) -> Result<()> {
        let connection = self
            .connections
            .get(&handle)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::protocol(format!("unknown ws handle {handle}")))?;
        let mut guard = connection.lock().await;
        guard.send(opcode, payload).await
    }

    pub async fn receive(&self, handle: u64) -> Result<(WsOpcode, Bytes)> {
        let connection = self
            .connections
            .get(&handle)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::protocol(format!("unknown ws handle {handle}")))?;
        let mut guard = connection.lock().await;
        guard.receive().await
    }

    pub async fn close(&self, handle: u64) {
        if let Some((_, connection)) = self.connections.remove(&handle) {
            if let Ok(connection) = Arc::try_unwrap(connection) {
                connection.into_inner().close().await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
