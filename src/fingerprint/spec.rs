//! Normalized transport description derived from fingerprints.
//!
//! A [`TransportSpec`] is the engine-internal, library-independent form of
//! all fingerprint data attached to a request. It is immutable once built:
//! GREASE slots stay symbolic here and are only materialized into concrete
//! values at handshake time, so re-parsing equal input always yields an
//! equal spec.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fingerprint::http2::Http2Fingerprint;
use crate::fingerprint::ja3::Ja3Fingerprint;
use crate::fingerprint::ja4::{Ja4Fingerprint, Ja4Transport};
use crate::fingerprint::quic::QuicFingerprint;

/// TLS 1.2 wire version.
pub const TLS1_2: u16 = 0x0303;
/// TLS 1.3 wire version.
pub const TLS1_3: u16 = 0x0304;

/// TLS 1.3 cipher suite id range (TLS_AES_128_GCM_SHA256 .. TLS_AES_128_CCM_8_SHA256).
pub fn is_tls13_cipher(id: u16) -> bool {
    (0x1301..=0x1305).contains(&id)
}

/// GREASE ids occupy the 0x?A?A pattern with equal nibble pairs.
pub fn is_grease(id: u16) -> bool {
    id & 0x0f0f == 0x0a0a && (id >> 8) & 0x0f == (id & 0x0f)
}

/// supported_versions extension id.
const EXT_SUPPORTED_VERSIONS: u16 = 43;

/// Payload class of one ClientHello extension slot.
///
/// Context-dependent classes (SNI, key_share, ...) are filled with live
/// content at handshake time from the dial target; the parser only records
/// which class the slot is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExtensionPayload {
    /// Server name indication, filled from the dial target.
    Sni,
    /// ALPN protocol list.
    Alpn,
    /// supported_groups, content from the spec's group list.
    SupportedGroups,
    /// ec_point_formats, content from the spec's point format list.
    PointFormats,
    /// signature_algorithms, content from the spec's sigalg list.
    SignatureAlgorithms,
    /// supported_versions, derived from the spec's version range.
    SupportedVersions,
    /// key_share, generated per handshake for the key-share groups.
    KeyShare,
    /// session_ticket, live session state.
    SessionTicket,
    /// pre_shared_key, live session state.
    PreSharedKey,
    /// A GREASE slot, randomized per handshake (or omitted entirely when
    /// GREASE is disabled).
    Grease,
    /// Raw opaque extension with a fixed body (zero-length for ids only
    /// known from a JA3 list).
    Opaque(Vec<u8>),
}

/// One ordered extension slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionEntry {
    pub id: u16,
    pub payload: ExtensionPayload,
}

impl ExtensionEntry {
    /// Classify a numeric extension id into its payload class.
    pub fn from_id(id: u16) -> Self {
        let payload = if is_grease(id) {
            ExtensionPayload::Grease
        } else {
            match id {
                0 => ExtensionPayload::Sni,
                10 => ExtensionPayload::SupportedGroups,
                11 => ExtensionPayload::PointFormats,
                13 => ExtensionPayload::SignatureAlgorithms,
                16 => ExtensionPayload::Alpn,
                35 => ExtensionPayload::SessionTicket,
                41 => ExtensionPayload::PreSharedKey,
                43 => ExtensionPayload::SupportedVersions,
                51 => ExtensionPayload::KeyShare,
                _ => ExtensionPayload::Opaque(Vec::new()),
            }
        };
        Self { id, payload }
    }
}

/// Which fingerprint source produced the TLS portion of a spec. The
/// handshake driver consults this for the TLS 1.2 fallback rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecSource {
    Ja3,
    /// JA4R-derived; the original JA3 string is kept when one was supplied
    /// alongside, enabling the TLS 1.2 fallback.
    Ja4r { fallback_ja3: Option<String> },
}

/// The canonical fingerprint-derived description of how to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    pub min_version: u16,
    pub max_version: u16,
    /// Cipher ids in exact wire order; may contain GREASE slots.
    pub ciphers: Vec<u16>,
    /// Extension slots in exact wire order.
    pub extensions: Vec<ExtensionEntry>,
    /// supported_groups content, in order.
    pub groups: Vec<u16>,
    /// signature_algorithms content, in order.
    pub signature_algorithms: Vec<u16>,
    /// ec_point_formats content.
    pub point_formats: Vec<u8>,
    /// ALPN protocols offered, in order.
    pub alpn: Vec<String>,
    /// Groups for which key shares are generated.
    pub key_share_groups: Vec<u16>,
    /// When true every GREASE slot is omitted outright.
    pub disable_grease: bool,
    pub source: SpecSource,
    pub http2: Option<Http2Fingerprint>,
    pub quic: Option<QuicFingerprint>,
}

impl TransportSpec {
    /// Build a spec from a parsed JA3.
    pub fn from_ja3(ja3: &Ja3Fingerprint, disable_grease: bool) -> Self {
        let has_tls13 = ja3.ciphers.iter().copied().any(is_tls13_cipher)
            || ja3.extensions.contains(&EXT_SUPPORTED_VERSIONS);
        let max_version = if has_tls13 { TLS1_3 } else { ja3.tls_version.min(TLS1_2) };

        let key_share_groups = ja3
            .groups
            .iter()
            .copied()
            .filter(|g| !is_grease(*g))
            .take(1)
            .collect();

        Self {
            min_version: TLS1_2.min(ja3.tls_version),
            max_version,
            ciphers: ja3.ciphers.clone(),
            extensions: ja3.extensions.iter().map(|&id| ExtensionEntry::from_id(id)).collect(),
            groups: ja3.groups.clone(),
            signature_algorithms: default_signature_algorithms(),
            point_formats: ja3.point_formats.clone(),
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            key_share_groups,
            disable_grease,
            source: SpecSource::Ja3,
            http2: None,
            quic: None,
        }
    }

    /// Build a spec from JA4R, optionally enriched by a JA3.
    ///
    /// JA4R wins cipher order, extension order, and signature algorithm
    /// content; the JA3 (when present) contributes supported groups and
    /// point formats and is recorded for the TLS 1.2 fallback.
    pub fn from_ja4r(ja4: &Ja4Fingerprint, ja3: Option<&Ja3Fingerprint>, disable_grease: bool) -> Self {
        let groups = ja3.map(|j| j.groups.clone()).unwrap_or_else(default_groups);
        let point_formats = ja3.map(|j| j.point_formats.clone()).unwrap_or_else(|| vec![0]);

        let alpn = {
            let tagged = ja4.alpn_protocols();
            if tagged.is_empty() {
                vec!["h2".to_string(), "http/1.1".to_string()]
            } else {
                tagged
            }
        };

        let key_share_groups = groups.iter().copied().filter(|g| !is_grease(*g)).take(1).collect();

        let quic = matches!(ja4.transport, Ja4Transport::Quic)
            .then(|| QuicFingerprint::from_ja4r_prefix(&ja4.alpn, ja4.extensions.len()));

        Self {
            min_version: TLS1_2,
            max_version: ja4.tls_version,
            ciphers: ja4.ciphers.clone(),
            extensions: ja4.extensions.iter().map(|&id| ExtensionEntry::from_id(id)).collect(),
            groups,
            signature_algorithms: ja4.signature_algorithms.clone(),
            point_formats,
            alpn,
            key_share_groups,
            disable_grease,
            source: SpecSource::Ja4r {
                fallback_ja3: ja3.map(|j| j.to_ja3_string()),
            },
            http2: None,
            quic,
        }
    }

    /// Resolve the spec for a request from its raw fingerprint strings.
    pub fn resolve(
        ja3: Option<&str>,
        ja4r: Option<&str>,
        http2: Option<&str>,
        quic: Option<&str>,
        disable_grease: bool,
    ) -> Result<Self> {
        let parsed_ja3 = match ja3.filter(|s| !s.is_empty()) {
            Some(s) => Some(Ja3Fingerprint::parse(s)?),
            None => None,
        };

        let mut spec = match ja4r.filter(|s| !s.is_empty()) {
            Some(s) => {
                let ja4 = Ja4Fingerprint::parse(s)?;
                Self::from_ja4r(&ja4, parsed_ja3.as_ref(), disable_grease)
            }
            None => {
                let ja3 = parsed_ja3.ok_or_else(|| {
                    Error::fingerprint("ja3", 0, "no TLS fingerprint supplied")
                })?;
                Self::from_ja3(&ja3, disable_grease)
            }
        };

        if let Some(s) = http2.filter(|s| !s.is_empty()) {
            spec.http2 = Some(Http2Fingerprint::parse(s)?);
        }
        if let Some(s) = quic.filter(|s| !s.is_empty()) {
            spec.quic = Some(QuicFingerprint::parse(s)?);
        }

        Ok(spec)
    }

    /// True when the TLS portion came from a JA4R with a max version of 1.3.
    pub fn is_ja4r_tls13(&self) -> bool {
        matches!(self.source, SpecSource::Ja4r { .. }) && self.max_version >= TLS1_3
    }

    /// The JA3 recorded for TLS 1.2 fallback, if any.
    pub fn fallback_ja3(&self) -> Option<&str> {
        match &self.source {
            SpecSource::Ja4r { fallback_ja3 } => fallback_ja3.as_deref(),
            SpecSource::Ja3 => None,
        }
    }

    /// Stable hash over every fingerprint-relevant TLS field, used in the
    /// pool key so distinct fingerprints never share a transport.
    pub fn fingerprint_hash(&self) -> [u8; 16] {
        let mut hasher = Sha256::new();
        hasher.update(self.min_version.to_be_bytes());
        hasher.update(self.max_version.to_be_bytes());
        hasher.update([u8::from(self.disable_grease)]);
        for id in &self.ciphers {
            hasher.update(id.to_be_bytes());
        }
        hasher.update([0xff]);
        for ext in &self.extensions {
            hasher.update(ext.id.to_be_bytes());
        }
        hasher.update([0xff]);
        for id in &self.groups {
            hasher.update(id.to_be_bytes());
        }
        hasher.update([0xff]);
        for id in &self.signature_algorithms {
            hasher.update(id.to_be_bytes());
        }
        hasher.update([0xff]);
        for proto in &self.alpn {
            hasher.update(proto.as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        out
    }

    /// Stable hash over the HTTP/2 shape (all-zero when none is set).
    pub fn h2_shape_hash(&self) -> [u8; 16] {
        let Some(h2) = &self.http2 else { return [0u8; 16] };
        let mut hasher = Sha256::new();
        for (k, v) in &h2.settings {
            hasher.update(k.to_be_bytes());
            hasher.update(v.to_be_bytes());
        }
        hasher.update(h2.window_update.to_be_bytes());
        for p in &h2.priorities {
            hasher.update(p.stream_id.to_be_bytes());
            hasher.update([u8::from(p.exclusive), p.weight]);
            hasher.update(p.depends_on.to_be_bytes());
        }
        hasher.update(h2.pseudo_order.akamai_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        out
    }
}

fn default_groups() -> Vec<u16> {
    // X25519, P-256, P-384
    vec![29, 23, 24]
}

fn default_signature_algorithms() -> Vec<u16> {
    vec![0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601]
}

/// Pool lookup key. Two requests that differ in any fingerprint-relevant
/// field get distinct keys and therefore distinct transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub tls_max_version: u16,
    pub fingerprint_hash: [u8; 16],
    pub h2_shape_hash: [u8; 16],
    pub proxy: Option<String>,
    pub sni_override: Option<String>,
}

impl ConnectionKey {
    pub fn new(
        scheme: &str,
        host: &str,
        port: u16,
        spec: &TransportSpec,
        proxy: Option<&str>,
        sni_override: Option<&str>,
    ) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            tls_max_version: spec.max_version,
            fingerprint_hash: spec.fingerprint_hash(),
            h2_shape_hash: spec.h2_shape_hash(),
            proxy: proxy.map(str::to_string),
            sni_override: sni_override.map(str::to_string),
        }
    }

    /// The dial-serialization key: address only, no fingerprint fields.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
