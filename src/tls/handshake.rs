//! Fingerprinted TLS dial with the retry ladder.
//!
//! One dial attempt wraps a TCP (or proxied) socket with the synthesized
//! ClientHello. Two recovery rules sit on top:
//!
//! 1. TLS 1.3 auto-retry: a handshake aborted for an unsupported curve is
//!    redialed once with supported_groups rewritten to the TLS 1.3 curve
//!    set, cipher and extension order untouched.
//! 2. TLS 1.2 JA3 fallback: a JA4R-derived TLS 1.3 spec refused by the
//!    server (version or ALPN) is redialed once as a TLS 1.2 spec rebuilt
//!    from the attached JA3, when one is attached.

use boring::ssl::{SslConnector, SslMethod, SslSessionCacheMode, SslVerifyMode, SslVersion};
use boring_sys::SSL_CTX;
use std::os::raw::c_int;
use tokio::net::TcpStream;
use tokio_boring::SslStream;

use crate::error::{Error, Result};
use crate::fingerprint::ja3::Ja3Fingerprint;
use crate::fingerprint::spec::{is_tls13_cipher, TransportSpec, TLS1_2};
use crate::tls::hello::{offered_versions, synthesize, ClientHello};
use crate::transport::proxy::ProxyConfig;

extern "C" {
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
}

/// TLS 1.3 compatible curve set used by the auto-retry: X25519, P-256,
/// P-384, P-521.
pub const TLS13_CURVES: [u16; 4] = [29, 23, 24, 25];

/// What to dial.
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
    /// SNI override; defaults to the host.
    pub server_name: Option<String>,
    pub insecure_skip_verify: bool,
    pub proxy: Option<ProxyConfig>,
}

impl DialTarget {
    pub fn sni(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    H2,
    Http1,
    None,
}

/// An established fingerprinted TLS connection.
pub struct TlsConnection {
    pub stream: SslStream<TcpStream>,
    pub alpn: AlpnProtocol,
    /// The hello that was actually on the wire (after any retry rewrote it).
    pub hello: ClientHello,
    /// True when the TLS 1.2 fallback produced this connection.
    pub fell_back_to_tls12: bool,
}

/// Enumerated handshake failure classes. The retry rules consume this enum
/// only; raw error text is inspected in exactly one place, the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Alert 40 (handshake_failure): no common parameters.
    HandshakeAlert,
    /// Alert 47 (illegal_parameter) or an unsupported/wrong curve.
    UnsupportedCurve,
    /// Alert 70 (protocol_version): peer refuses the offered versions.
    ProtocolVersion,
    /// Alert 120 / no_application_protocol: peer refused every ALPN entry.
    AlpnRefused,
    /// Anything else: IO, cert validation, unknown alerts.
    Other,
}

/// Map a boring handshake error onto the failure enum. This is the single
/// place allowed to look at error text.
fn classify_failure(message: &str) -> HandshakeFailure {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no_application_protocol") || lower.contains("alert number 120") {
        HandshakeFailure::AlpnRefused
    } else if lower.contains("wrong curve")
        || lower.contains("unsupported group")
        || lower.contains("illegal_parameter")
        || lower.contains("alert number 47")
    {
        HandshakeFailure::UnsupportedCurve
    } else if lower.contains("protocol_version")
        || lower.contains("unsupported protocol")
        || lower.contains("alert number 70")
    {
        HandshakeFailure::ProtocolVersion
    } else if lower.contains("handshake_failure") || lower.contains("alert number 40") {
        HandshakeFailure::HandshakeAlert
    } else {
        HandshakeFailure::Other
    }
}

/// Dial with retry. The caller holds the per-address mutex across this
/// whole call, so concurrent requests to the same remote never redial in
/// parallel.
pub async fn dial(
    target: &DialTarget,
    spec: &TransportSpec,
    tls13_auto_retry: bool,
) -> Result<TlsConnection> {
    let mut attempted: Vec<&'static str> = Vec::new();

    let primary = attempt(target, spec).await;
    let failure = match primary {
        Ok(conn) => {
            // A JA4R TLS 1.3 spec whose server declined h2 falls back to a
            // TLS 1.2 JA3 dial so the wire identity stays coherent.
            if conn.alpn == AlpnProtocol::None
                && spec.alpn.iter().any(|p| p == "h2")
                && spec.is_ja4r_tls13()
                && spec.fallback_ja3().is_some()
            {
                tracing::debug!(host = %target.host, "server refused ALPN, trying TLS 1.2 JA3 fallback");
                HandshakeFailure::AlpnRefused
            } else {
                return Ok(conn);
            }
        }
        Err((hello, err)) => {
            attempted.extend(offered_versions(&hello));
            let failure = classify_failure(&err);
            tracing::debug!(host = %target.host, ?failure, "primary handshake failed: {err}");
            failure
        }
    };

    // Rule 1: unsupported curve + auto-retry flag.
    if tls13_auto_retry
        && matches!(failure, HandshakeFailure::UnsupportedCurve | HandshakeFailure::HandshakeAlert)
    {
        let retry_spec = with_tls13_curves(spec);
        match attempt(target, &retry_spec).await {
            Ok(conn) => return Ok(conn),
            Err((hello, err)) => {
                attempted.extend(offered_versions(&hello));
                tracing::debug!(host = %target.host, "TLS 1.3 curve retry failed: {err}");
                // Fall through to the JA3 fallback check below.
                if !matches!(classify_failure(&err), HandshakeFailure::ProtocolVersion) {
                    return Err(Error::tls(err, attempted));
                }
            }
        }
    }

    // Rule 2: TLS 1.2 JA3 fallback.
    if matches!(failure, HandshakeFailure::ProtocolVersion | HandshakeFailure::AlpnRefused)
        && spec.is_ja4r_tls13()
    {
        if let Some(ja3_str) = spec.fallback_ja3() {
            let ja3 = Ja3Fingerprint::parse(ja3_str)?;
            let fallback = tls12_spec_from_ja3(&ja3, spec.disable_grease);
            match attempt(target, &fallback).await {
                Ok(mut conn) => {
                    conn.fell_back_to_tls12 = true;
                    return Ok(conn);
                }
                Err((hello, err)) => {
                    attempted.extend(offered_versions(&hello));
                    return Err(Error::tls(err, attempted));
                }
            }
        }
    }

    match failure {
        HandshakeFailure::AlpnRefused => Err(Error::tls("no application protocol", attempted)),
        _ => Err(Error::tls("handshake failed after all retries", attempted)),
    }
}

/// A spec copy with supported_groups rewritten to the TLS 1.3 curve set.
/// Cipher and extension order are untouched.
fn with_tls13_curves(spec: &TransportSpec) -> TransportSpec {
    let mut retry = spec.clone();
    retry.groups = TLS13_CURVES.to_vec();
    retry.key_share_groups = vec![TLS13_CURVES[0]];
    retry
}

/// A TLS 1.2 spec rebuilt from a JA3: 1.3-only ciphers dropped, version
/// capped, order otherwise preserved.
fn tls12_spec_from_ja3(ja3: &Ja3Fingerprint, disable_grease: bool) -> TransportSpec {
    let mut spec = TransportSpec::from_ja3(ja3, disable_grease);
    spec.ciphers.retain(|&id| !is_tls13_cipher(id));
    spec.extensions.retain(|e| !matches!(e.id, 43 | 51 | 45)); // no 1.3 negotiation extensions
    spec.min_version = TLS1_2;
    spec.max_version = TLS1_2;
    spec.alpn = vec!["http/1.1".to_string()];
    spec
}

/// One handshake attempt; on failure the synthesized hello rides along so
/// the caller can record which versions were offered.
async fn attempt(
    target: &DialTarget,
    spec: &TransportSpec,
) -> std::result::Result<TlsConnection, (ClientHello, String)> {
    let hello = match synthesize(spec) {
        Ok(h) => h,
        Err(e) => return Err((fallback_hello(spec), e.to_string())),
    };

    let tcp = match open_tcp(target).await {
        Ok(s) => s,
        Err(e) => return Err((hello, e.to_string())),
    };

    let connector = match configure(&hello, target.insecure_skip_verify) {
        Ok(c) => c,
        Err(e) => return Err((hello, e.to_string())),
    };

    let config = match connector.configure() {
        Ok(c) => c,
        Err(e) => return Err((hello, format!("ssl configure: {e}"))),
    };

    let stream = match tokio_boring::connect(config, target.sni(), tcp).await {
        Ok(s) => s,
        Err(e) => return Err((hello, e.to_string())),
    };

    let alpn = match stream.ssl().selected_alpn_protocol() {
        Some(b"h2") => AlpnProtocol::H2,
        Some(b"http/1.1") => AlpnProtocol::Http1,
        _ => AlpnProtocol::None,
    };

    Ok(TlsConnection {
        stream,
        alpn,
        hello,
        fell_back_to_tls12: false,
    })
}

fn fallback_hello(spec: &TransportSpec) -> ClientHello {
    ClientHello {
        min_version: spec.min_version,
        max_version: spec.max_version,
        ciphers: Vec::new(),
        extensions: Vec::new(),
        groups: Vec::new(),
        signature_algorithms: Vec::new(),
        point_formats: Vec::new(),
        alpn: Vec::new(),
        key_share_groups: Vec::new(),
        grease_enabled: false,
    }
}

/// Open the TCP socket, through the proxy when one is configured.
async fn open_tcp(target: &DialTarget) -> Result<TcpStream> {
    match &target.proxy {
        Some(proxy) => proxy.establish(&target.host, target.port).await,
        None => {
            let addr = format!("{}:{}", target.host, target.port);
            TcpStream::connect(&addr)
                .await
                .map_err(|e| Error::connection(format!("connect {addr}: {e}")))
        }
    }
}

/// Map the synthesized hello onto a BoringSSL connector.
fn configure(hello: &ClientHello, insecure: bool) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| Error::tls(format!("ssl builder: {e}"), vec![]))?;

    let cipher_names = cipher_list_names(&hello.ciphers);
    if !cipher_names.is_empty() {
        builder
            .set_cipher_list(&cipher_names.join(":"))
            .map_err(|e| Error::tls(format!("cipher list: {e}"), vec![]))?;
    }

    let curve_names = curve_list_names(&hello.groups);
    if !curve_names.is_empty() {
        builder
            .set_curves_list(&curve_names.join(":"))
            .map_err(|e| Error::tls(format!("curves: {e}"), vec![]))?;
    }

    let sigalg_names = sigalg_list_names(&hello.signature_algorithms);
    if !sigalg_names.is_empty() {
        builder
            .set_sigalgs_list(&sigalg_names.join(":"))
            .map_err(|e| Error::tls(format!("sigalgs: {e}"), vec![]))?;
    }

    builder
        .set_min_proto_version(Some(ssl_version(hello.min_version)))
        .map_err(|e| Error::tls(format!("min version: {e}"), vec![]))?;
    builder
        .set_max_proto_version(Some(ssl_version(hello.max_version)))
        .map_err(|e| Error::tls(format!("max version: {e}"), vec![]))?;

    if !hello.alpn.is_empty() {
        builder
            .set_alpn_protos(&hello.alpn_wire())
            .map_err(|e| Error::tls(format!("alpn: {e}"), vec![]))?;
    }

    // GREASE and extension permutation follow the synthesized hello.
    unsafe {
        let ctx = builder.as_ptr() as *mut SSL_CTX;
        SSL_CTX_set_grease_enabled(ctx, c_int::from(hello.grease_enabled));
        SSL_CTX_set_permute_extensions(ctx, 0);
    }

    builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

    if insecure {
        builder.set_verify(SslVerifyMode::NONE);
    }

    Ok(builder.build())
}

fn ssl_version(wire: u16) -> SslVersion {
    match wire {
        0x0301 => SslVersion::TLS1,
        0x0302 => SslVersion::TLS1_1,
        0x0303 => SslVersion::TLS1_2,
        _ => SslVersion::TLS1_3,
    }
}

/// OpenSSL cipher names for the TLS 1.2 suites browsers offer. TLS 1.3
/// suites are fixed in BoringSSL and excluded from the cipher-list string.
fn cipher_list_names(ids: &[u16]) -> Vec<&'static str> {
    ids.iter()
        .filter_map(|&id| match id {
            0xc02b => Some("ECDHE-ECDSA-AES128-GCM-SHA256"),
            0xc02f => Some("ECDHE-RSA-AES128-GCM-SHA256"),
            0xc02c => Some("ECDHE-ECDSA-AES256-GCM-SHA384"),
            0xc030 => Some("ECDHE-RSA-AES256-GCM-SHA384"),
            0xcca9 => Some("ECDHE-ECDSA-CHACHA20-POLY1305"),
            0xcca8 => Some("ECDHE-RSA-CHACHA20-POLY1305"),
            0xc009 => Some("ECDHE-ECDSA-AES128-SHA"),
            0xc00a => Some("ECDHE-ECDSA-AES256-SHA"),
            0xc013 => Some("ECDHE-RSA-AES128-SHA"),
            0xc014 => Some("ECDHE-RSA-AES256-SHA"),
            0x009c => Some("AES128-GCM-SHA256"),
            0x009d => Some("AES256-GCM-SHA384"),
            0x002f => Some("AES128-SHA"),
            0x0035 => Some("AES256-SHA"),
            0x000a => Some("DES-CBC3-SHA"),
            _ => None,
        })
        .collect()
}

fn curve_list_names(ids: &[u16]) -> Vec<&'static str> {
    ids.iter()
        .filter_map(|&id| match id {
            29 => Some("X25519"),
            23 => Some("P-256"),
            24 => Some("P-384"),
            25 => Some("P-521"),
            0x11ec => Some("X25519Kyber768Draft00"),
            _ => None,
        })
        .collect()
}

fn sigalg_list_names(ids: &[u16]) -> Vec<&'static str> {
    ids.iter()
        .filter_map(|&id| match id {
            0x0403 => Some("ecdsa_secp256r1_sha256"),
            0x0503 => Some("ecdsa_secp384r1_sha384"),
            0x0603 => Some("ecdsa_secp521r1_sha512"),
            0x0804 => Some("rsa_pss_rsae_sha256"),
            0x0805 => Some("rsa_pss_rsae_sha384"),
            0x0806 => Some("rsa_pss_rsae_sha512"),
            0x0401 => Some("rsa_pkcs1_sha256"),
            0x0501 => Some("rsa_pkcs1_sha384"),
            0x0601 => Some("rsa_pkcs1_sha512"),
            0x0201 => Some("rsa_pkcs1_sha1"),
            0x0203 => Some("ecdsa_sha1"),
            _ => None,
        })
        .collect()
}
