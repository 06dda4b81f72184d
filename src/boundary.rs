//! Host-boundary message schema and MessagePack codec.
//!
//! Payloads are MessagePack; the legacy entry points additionally base64-
//! wrap them so they survive null-free string transport. Field names match
//! the established wire schema (`requestId`/`options` envelope in,
//! `RequestID`/`Status`/... out).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cookie::{Cookie, SameSite};
use crate::error::{Error, Result};
use crate::request::{Protocol, Request};
use crate::response::Response;

/// Map-shaped fields whose entry order is significant. Serialized as a
/// msgpack map, deserialized into a Vec so insertion order survives.
mod ordered_map {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        entries: &[(String, String)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, String)>, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Binary body field: accepts both msgpack bin and int-array encodings.
mod loose_bytes {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Option<Vec<u8>>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("bytes or a sequence of bytes")
            }

            fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
                d.deserialize_any(BytesVisitor)
            }

            fn visit_bytes<E: Error>(self, bytes: &[u8]) -> Result<Self::Value, E> {
                Ok(Some(bytes.to_vec()))
            }

            fn visit_byte_buf<E: Error>(self, bytes: Vec<u8>) -> Result<Self::Value, E> {
                Ok(Some(bytes))
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(Some(value.as_bytes().to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut bytes = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(byte) = access.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Ok(Some(bytes))
            }
        }

        deserializer.deserialize_option(BytesVisitor)
    }
}

/// Cookie as it crosses the boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireCookie {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// RFC 3339 with nanosecond precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, rename = "maxAge", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secure: bool,
    #[serde(default, rename = "httpOnly", skip_serializing_if = "std::ops::Not::not")]
    pub http_only: bool,
    #[serde(default, rename = "sameSite", skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

impl WireCookie {
    pub fn from_cookie(cookie: &Cookie) -> Self {
        Self {
            name: cookie.name.clone(),
            value: cookie.value.clone(),
            path: Some(cookie.path.clone()).filter(|p| !p.is_empty()),
            domain: Some(cookie.domain.clone()).filter(|d| !d.is_empty()),
            expires: cookie
                .expires
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            max_age: cookie.max_age,
            secure: cookie.secure,
            http_only: cookie.http_only,
            same_site: match cookie.same_site {
                SameSite::Default => None,
                other => Some(other.as_str().to_string()),
            },
        }
    }

    pub fn into_cookie(self) -> Cookie {
        let mut cookie = Cookie::new(self.name, self.value);
        if let Some(path) = self.path {
            cookie.path = path;
        }
        if let Some(domain) = self.domain {
            cookie.domain = domain.trim_start_matches('.').to_ascii_lowercase();
            cookie.host_only = false;
        }
        cookie.expires = self
            .expires
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        cookie.max_age = self.max_age;
        cookie.secure = self.secure;
        cookie.http_only = self.http_only;
        cookie.same_site = self
            .same_site
            .map(|s| SameSite::parse(&s))
            .unwrap_or_default();
        cookie
    }
}

/// Request options, camelCase wire keys.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub url: String,
    pub method: String,
    pub body: String,
    #[serde(rename = "bodyBytes", deserialize_with = "loose_bytes::deserialize")]
    pub body_bytes: Option<Vec<u8>>,
    #[serde(with = "ordered_map")]
    pub headers: Vec<(String, String)>,
    #[serde(rename = "headerOrder")]
    pub header_order: Option<Vec<String>>,
    #[serde(rename = "orderHeadersAsProvided")]
    pub order_headers_as_provided: bool,
    pub cookies: Vec<WireCookie>,
    pub ja3: String,
    pub ja4r: Option<String>,
    #[serde(rename = "http2Fingerprint")]
    pub http2_fingerprint: Option<String>,
    #[serde(rename = "quicFingerprint")]
    pub quic_fingerprint: Option<String>,
    pub fingerprint: Option<String>,
    #[serde(rename = "disableGrease")]
    pub disable_grease: bool,
    #[serde(rename = "userAgent")]
    pub user_agent: String,
    pub proxy: String,
    /// Seconds; 0 selects the engine default.
    pub timeout: u64,
    #[serde(rename = "disableRedirect")]
    pub disable_redirect: bool,
    #[serde(rename = "enableConnectionReuse")]
    pub enable_connection_reuse: Option<bool>,
    #[serde(rename = "insecureSkipVerify")]
    pub insecure_skip_verify: bool,
    #[serde(rename = "serverName")]
    pub server_name: Option<String>,
    #[serde(rename = "forceHTTP1")]
    pub force_http1: bool,
    #[serde(rename = "forceHTTP3")]
    pub force_http3: bool,
    pub protocol: Option<String>,
    #[serde(rename = "tls13AutoRetry")]
    pub tls13_auto_retry: Option<bool>,
}

/// The `{requestId, options}` envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestEnvelope {
    #[serde(rename = "requestId", alias = "RequestID")]
    pub request_id: String,
    pub options: RequestOptions,
}

/// Batch envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchEnvelope {
    pub requests: Vec<RequestEnvelope>,
}

/// Response payload, canonical output keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(rename = "RequestID")]
    pub request_id: String,
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "Body")]
    pub body: String,
    #[serde(rename = "BodyBytes", skip_serializing_if = "Option::is_none")]
    #[serde(default, deserialize_with = "loose_bytes::deserialize")]
    pub body_bytes: Option<Vec<u8>>,
    #[serde(rename = "Headers", with = "ordered_map")]
    pub headers: Vec<(String, String)>,
    #[serde(rename = "FinalUrl")]
    pub final_url: String,
    #[serde(rename = "Cookies")]
    pub cookies: Vec<WireCookie>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponsePayload {
    pub responses: Vec<ResponsePayload>,
}

const VALID_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Invalid or empty methods normalize to GET.
pub fn normalize_method(method: &str) -> String {
    let upper = method.trim().to_ascii_uppercase();
    if VALID_METHODS.contains(&upper.as_str()) {
        upper
    } else {
        "GET".to_string()
    }
}

impl RequestEnvelope {
    /// Convert the wire envelope into the engine request.
    pub fn into_request(self) -> Request {
        let options = self.options;
        let body = if let Some(bytes) = options.body_bytes {
            Some(Bytes::from(bytes))
        } else if !options.body.is_empty() {
            Some(Bytes::from(options.body.into_bytes()))
        } else {
            None
        };

        Request {
            request_id: self.request_id,
            url: options.url,
            method: normalize_method(&options.method),
            headers: options.headers,
            header_order: options.header_order,
            order_headers_as_provided: options.order_headers_as_provided,
            cookies: options.cookies.into_iter().map(WireCookie::into_cookie).collect(),
            body,
            profile: options.fingerprint.filter(|s| !s.is_empty()),
            ja3: Some(options.ja3).filter(|s| !s.is_empty()),
            ja4r: options.ja4r.filter(|s| !s.is_empty()),
            http2_fingerprint: options.http2_fingerprint.filter(|s| !s.is_empty()),
            quic_fingerprint: options.quic_fingerprint.filter(|s| !s.is_empty()),
            disable_grease: options.disable_grease,
            user_agent: Some(options.user_agent).filter(|s| !s.is_empty()),
            proxy: Some(options.proxy).filter(|s| !s.is_empty()),
            timeout: Duration::from_secs(options.timeout),
            disable_redirect: options.disable_redirect,
            enable_connection_reuse: options.enable_connection_reuse.unwrap_or(true),
            insecure_skip_verify: options.insecure_skip_verify,
            server_name: options.server_name.filter(|s| !s.is_empty()),
            force_http1: options.force_http1,
            force_http3: options.force_http3,
            protocol: options.protocol.as_deref().and_then(Protocol::parse),
            tls13_auto_retry: options.tls13_auto_retry.unwrap_or(true),
        }
    }
}

impl ResponsePayload {
    /// Success payload from an engine response.
    pub fn from_response(request_id: &str, response: &Response) -> Self {
        let body_is_text = std::str::from_utf8(response.body()).is_ok();
        Self {
            request_id: request_id.to_string(),
            status: response.status,
            body: String::from_utf8_lossy(response.body()).into_owned(),
            body_bytes: (!body_is_text).then(|| response.body().to_vec()),
            headers: fold_headers(&response.headers),
            final_url: response.final_url.clone(),
            cookies: response.cookies.iter().map(WireCookie::from_cookie).collect(),
        }
    }

    /// Error payload: status 0 with the diagnostic in the body.
    pub fn from_error(request_id: &str, error: &Error) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: 0,
            body: error.to_string(),
            body_bytes: None,
            headers: Vec::new(),
            final_url: String::new(),
            cookies: Vec::new(),
        }
    }
}

/// Fold duplicate header names the way a string map transport expects,
/// preserving first-seen position.
fn fold_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut folded: Vec<(String, String)> = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        match folded
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some((_, existing_value)) => {
                existing_value.push_str(", ");
                existing_value.push_str(value);
            }
            None => folded.push((name.clone(), value.clone())),
        }
    }
    folded
}

// ---------------------------------------------------------------------------
// Codec entry points
// ---------------------------------------------------------------------------

/// Decode a raw msgpack request envelope.
pub fn decode_request(payload: &[u8]) -> Result<RequestEnvelope> {
    rmp_serde::from_slice(payload).map_err(|e| Error::Encode(format!("request payload: {e}")))
}

/// Decode a base64-wrapped msgpack request envelope (legacy transport).
pub fn decode_request_b64(payload: &str) -> Result<RequestEnvelope> {
    let raw = BASE64
        .decode(payload.trim())
        .map_err(|e| Error::Encode(format!("base64: {e}")))?;
    decode_request(&raw)
}

/// Decode a raw msgpack batch envelope.
pub fn decode_batch(payload: &[u8]) -> Result<BatchEnvelope> {
    rmp_serde::from_slice(payload).map_err(|e| Error::Encode(format!("batch payload: {e}")))
}

pub fn decode_batch_b64(payload: &str) -> Result<BatchEnvelope> {
    let raw = BASE64
        .decode(payload.trim())
        .map_err(|e| Error::Encode(format!("base64: {e}")))?;
    decode_batch(&raw)
}

/// Encode any serializable payload as raw msgpack. Map-style encoding keeps
/// the named keys on the wire.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut out).with_struct_map();
    payload
        .serialize(&mut serializer)
        .map_err(|e| Error::Encode(format!("response payload: {e}")))?;
    Ok(out)
}

/// Encode as base64-wrapped msgpack (legacy transport).
pub fn encode_payload_b64<T: Serialize>(payload: &T) -> Result<String> {
    Ok(BASE64.encode(encode_payload(payload)?))
}
