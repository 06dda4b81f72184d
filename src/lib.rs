//! # wraith
//!
//! Fingerprint-driven HTTP transport engine. Outgoing connections carry
//! the byte-level identity of a chosen browser build: the TLS ClientHello
//! (JA3/JA4R), the HTTP/2 SETTINGS preface (Akamai format), and the QUIC
//! Initial are all synthesized from fingerprint strings, and pooled
//! connections are keyed so that identity survives reuse.

// Core modules
pub mod cookie;
pub mod error;
pub mod headers;
pub mod request;
pub mod response;
pub mod version;

// Fingerprint parsing and synthesis
pub mod fingerprint;
pub mod tls;

// Transport layer
pub mod transport;

// Connection pooling
pub mod pool;

// Orchestration and the host boundary
pub mod boundary;
pub mod dispatch;
pub mod executor;

// Upgrade paths
pub mod sse;
pub mod ws;

// Re-exports for convenient access
pub use cookie::{Cookie, CookieJar, SameSite};
pub use error::{Error, Result};
pub use executor::Engine;
pub use fingerprint::{
    BrowserProfile, ConnectionKey, Http2Fingerprint, Ja3Fingerprint, Ja4Fingerprint,
    ProfileRegistry, QuicFingerprint, TransportSpec,
};
pub use request::{Protocol, Request};
pub use response::Response;
pub use version::HttpVersion;

pub use dispatch::{Dispatcher, Handle};
pub use pool::{ConnectionPool, Lease, Outcome};
pub use sse::{SseConnection, SseEvent, SseOptions, SseRegistry};
pub use ws::{WsConnection, WsOpcode, WsOptions, WsRegistry};
