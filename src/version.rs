//! HTTP protocol version selection.

/// Protocol version for a request or a live transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpVersion {
    /// Force HTTP/1.1.
    Http1,
    /// HTTP/2 over TLS ALPN.
    Http2,
    /// HTTP/3 over QUIC.
    Http3,
    /// Let ALPN decide between h2 and http/1.1.
    #[default]
    Auto,
}

impl HttpVersion {
    /// Wire-visible version string, as echoed in responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http1 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
            Self::Http3 => "HTTP/3",
            Self::Auto => "auto",
        }
    }

    /// Whether concurrent requests may share one transport under this version.
    pub fn multiplexes(&self) -> bool {
        matches!(self, Self::Http2 | Self::Http3)
    }
}
