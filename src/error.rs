//! Error types for the wraith engine.

use std::io;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing fingerprints, dialing, or carrying
/// a request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed JA3/JA4R/HTTP2/QUIC fingerprint string.
    #[error("fingerprint parse error in {field} at {position}: {reason}")]
    FingerprintParse {
        field: &'static str,
        position: usize,
        reason: String,
    },

    /// Structurally valid fingerprint whose pieces contradict each other.
    #[error("incoherent transport spec: {0}")]
    SpecIncoherent(String),

    /// TLS handshake failure after all retries.
    #[error("TLS error after trying {attempted_versions:?}: {cause}")]
    Tls {
        cause: String,
        attempted_versions: Vec<&'static str>,
    },

    /// TCP/UDP connect refused, DNS failure, missing host.
    #[error("connection error: {0}")]
    Connection(String),

    /// Proxy handshake failed.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Request-scoped deadline expired.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Malformed HTTP frame, GOAWAY without result, QUIC close with error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Redirect cap exceeded.
    #[error("too many redirects ({count})")]
    TooManyRedirects { count: u32 },

    /// Host-initiated cancellation observed.
    #[error("request cancelled")]
    Cancelled,

    /// Cookie parsing error.
    #[error("cookie parse error: {0}")]
    CookieParse(String),

    /// Decompression error.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Boundary payload encode/decode error.
    #[error("encode error: {0}")]
    Encode(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a fingerprint parse error.
    pub fn fingerprint(field: &'static str, position: usize, reason: impl Into<String>) -> Self {
        Self::FingerprintParse {
            field,
            position,
            reason: reason.into(),
        }
    }

    /// Create a TLS error recording which versions were attempted.
    pub fn tls(cause: impl Into<String>, attempted_versions: Vec<&'static str>) -> Self {
        Self::Tls {
            cause: cause.into(),
            attempted_versions,
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a proxy error.
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True for errors that leave the transport unusable for reuse.
    pub fn breaks_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Protocol(_) | Self::Timeout(_) | Self::Cancelled
        )
    }
}
