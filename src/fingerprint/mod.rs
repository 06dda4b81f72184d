//! Fingerprint parsing: JA3, JA4R, HTTP/2 (Akamai), QUIC, and browser
//! profile bundles, all normalized into a [`spec::TransportSpec`].

pub mod http2;
pub mod ja3;
pub mod ja4;
pub mod profiles;
pub mod quic;
pub mod spec;

pub use http2::{Http2Fingerprint, PseudoHeader, PseudoOrder, StreamPriority};
pub use ja3::Ja3Fingerprint;
pub use ja4::{Ja4Fingerprint, Ja4Transport};
pub use profiles::{BrowserProfile, ProfileRegistry};
pub use quic::QuicFingerprint;
pub use spec::{ConnectionKey, ExtensionEntry, ExtensionPayload, SpecSource, TransportSpec};
