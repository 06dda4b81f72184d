//! Stream type produced by the fingerprinted dial.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

use crate::error::{Error, Result};
use crate::fingerprint::spec::TransportSpec;
use crate::tls::handshake::{dial, AlpnProtocol, DialTarget};
use crate::version::HttpVersion;

/// Plain TCP for http, fingerprinted TLS for https.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
    /// In-memory pipe for unit tests.
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

impl MaybeTlsStream {
    /// ALPN outcome of the TLS handshake; plain streams have none.
    pub fn alpn(&self) -> AlpnProtocol {
        match self {
            Self::Plain(_) => AlpnProtocol::None,
            Self::Tls(stream) => match stream.ssl().selected_alpn_protocol() {
                Some(b"h2") => AlpnProtocol::H2,
                Some(b"http/1.1") => AlpnProtocol::Http1,
                _ => AlpnProtocol::None,
            },
            #[cfg(test)]
            Self::Mem(_) => AlpnProtocol::None,
        }
    }
}

/// A dialed stream plus what was negotiated on it.
pub struct DialedStream {
    pub stream: MaybeTlsStream,
    /// Protocol the stream must speak.
    pub version: HttpVersion,
}

/// Dial `host:port`, wrapping with fingerprinted TLS for https.
///
/// `prefer_h2` removes h2 from ALPN when false so a forced-HTTP/1.1 request
/// cannot be upgraded by the server.
pub async fn connect(
    scheme: &str,
    target: &DialTarget,
    spec: &TransportSpec,
    tls13_auto_retry: bool,
    prefer_h2: bool,
) -> Result<DialedStream> {
    if scheme == "https" {
        let effective_spec;
        let spec = if prefer_h2 {
            spec
        } else {
            let mut s = spec.clone();
            s.alpn.retain(|p| p != "h2");
            if s.alpn.is_empty() {
                s.alpn.push("http/1.1".to_string());
            }
            effective_spec = s;
            &effective_spec
        };

        let conn = dial(target, spec, tls13_auto_retry).await?;
        let version = match conn.alpn {
            AlpnProtocol::H2 => HttpVersion::Http2,
            _ => HttpVersion::Http1,
        };
        Ok(DialedStream {
            stream: MaybeTlsStream::Tls(Box::new(conn.stream)),
            version,
        })
    } else {
        let tcp = match &target.proxy {
            Some(proxy) => proxy.establish(&target.host, target.port).await?,
            None => {
                let addr = format!("{}:{}", target.host, target.port);
                TcpStream::connect(&addr)
                    .await
                    .map_err(|e| Error::connection(format!("connect {addr}: {e}")))?
            }
        };
        Ok(DialedStream {
            stream: MaybeTlsStream::Plain(tcp),
            version: HttpVersion::Http1,
        })
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(test)]
            Self::Mem(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            #[cfg(test)]
            Self::Mem(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(test)]
            Self::Mem(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(test)]
            Self::Mem(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
