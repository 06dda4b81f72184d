//! Transport layer: dial, proxy tunnels, and the three protocol carriers.

pub mod connector;
pub mod h1;
pub mod h2;
pub mod h3;
pub mod proxy;

pub use connector::{connect, DialedStream, MaybeTlsStream};
pub use h1::H1Connection;
pub use h2::H2Connection;
pub use h3::H3Client;
pub use proxy::{ProxyConfig, ProxyScheme};
