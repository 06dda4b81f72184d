//! Engine-side request model.

use std::time::Duration;

use bytes::Bytes;

use crate::cookie::Cookie;

/// Default JA3 applied when a request carries no fingerprint at all
/// (Firefox 87).
pub const DEFAULT_JA3: &str = "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-51-57-47-53-10,0-23-65281-10-11-35-16-5-51-43-13-45-28-21,29-23-24-25-256-257,0";

/// Default wall-clock deadline when the caller passes none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Redirect hop cap.
pub const MAX_REDIRECTS: u32 = 10;

/// Protocol selector from the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
    Websocket,
    Sse,
}

impl Protocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http1" => Some(Self::Http1),
            "http2" => Some(Self::Http2),
            "http3" => Some(Self::Http3),
            "websocket" => Some(Self::Websocket),
            "sse" => Some(Self::Sse),
            _ => None,
        }
    }
}

/// One request as the executor consumes it.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub url: String,
    pub method: String,
    /// Headers with explicit insertion order.
    pub headers: Vec<(String, String)>,
    pub header_order: Option<Vec<String>>,
    pub order_headers_as_provided: bool,
    pub cookies: Vec<Cookie>,
    pub body: Option<Bytes>,

    /// Browser profile name; resolved before the explicit strings below.
    pub profile: Option<String>,
    pub ja3: Option<String>,
    pub ja4r: Option<String>,
    pub http2_fingerprint: Option<String>,
    pub quic_fingerprint: Option<String>,
    pub disable_grease: bool,

    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub disable_redirect: bool,
    pub enable_connection_reuse: bool,
    pub insecure_skip_verify: bool,
    pub server_name: Option<String>,
    pub force_http1: bool,
    pub force_http3: bool,
    pub protocol: Option<Protocol>,
    pub tls13_auto_retry: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            url: String::new(),
            method: "GET".to_string(),
            headers: Vec::new(),
            header_order: None,
            order_headers_as_provided: false,
            cookies: Vec::new(),
            body: None,
            profile: None,
            ja3: None,
            ja4r: None,
            http2_fingerprint: None,
            quic_fingerprint: None,
            disable_grease: false,
            user_agent: None,
            proxy: None,
            timeout: DEFAULT_TIMEOUT,
            disable_redirect: false,
            enable_connection_reuse: true,
            insecure_skip_verify: false,
            server_name: None,
            force_http1: false,
            force_http3: false,
            protocol: None,
            tls13_auto_retry: true,
        }
    }
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            body: Some(body.into()),
            ..Self::default()
        }
    }
}
