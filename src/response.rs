//! HTTP response with transparent body decompression.

use std::io::Read;

use bytes::Bytes;

use crate::cookie::Cookie;
use crate::error::{Error, Result};
use crate::version::HttpVersion;

/// A carried response: status, headers in received order, body, cookies,
/// and the protocol that actually served it.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Headers exactly as received, order preserved.
    pub headers: Vec<(String, String)>,
    body: Bytes,
    pub version: HttpVersion,
    /// URL after following redirects.
    pub final_url: String,
    /// Cookies set by the server, full attributes.
    pub cookies: Vec<Cookie>,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes, version: HttpVersion) -> Self {
        Self {
            status,
            headers,
            body,
            version,
            final_url: String::new(),
            cookies: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.final_url = url.into();
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.status != 304
    }

    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All header values matching `name`, case-insensitive, in order.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(Error::from)
    }

    /// Transparently decompress the body per Content-Encoding.
    ///
    /// On success the body is replaced with the decoded bytes and the
    /// Content-Encoding header is stripped; on failure the raw bytes and
    /// the header stay untouched.
    pub fn decompress(&mut self) {
        let encoding = match self.header("content-encoding") {
            Some(v) => v.to_ascii_lowercase(),
            None => return,
        };

        let decoded = match encoding.as_str() {
            "gzip" | "x-gzip" => decode_gzip(&self.body),
            "deflate" => decode_deflate(&self.body),
            "br" => decode_brotli(&self.body),
            "zstd" => decode_zstd(&self.body),
            _ => return,
        };

        match decoded {
            Ok(body) => {
                self.body = body;
                self.headers
                    .retain(|(k, _)| !k.eq_ignore_ascii_case("content-encoding"));
            }
            Err(e) => {
                tracing::debug!("leaving body compressed: {e}");
            }
        }
    }
}

fn decode_gzip(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("gzip: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_deflate(data: &[u8]) -> Result<Bytes> {
    // Servers disagree on whether "deflate" means zlib-wrapped or raw.
    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(data).read_to_end(&mut decoded).is_ok() {
        return Ok(Bytes::from(decoded));
    }
    decoded.clear();
    flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("deflate: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_brotli(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("brotli: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_zstd(data: &[u8]) -> Result<Bytes> {
    zstd::stream::decode_all(data)
        .map(Bytes::from)
        .map_err(|e| Error::Decompression(format!("zstd: {e}")))
}
