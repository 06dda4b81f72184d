//! ClientHello synthesis and the fingerprinted handshake driver.

pub mod handshake;
pub mod hello;

pub use handshake::{dial, AlpnProtocol, DialTarget, HandshakeFailure, TlsConnection};
pub use hello::{synthesize, ClientHello, GREASE_VALUES};
