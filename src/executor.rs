//! Per-request orchestration: resolve the fingerprint, acquire a pooled
//! transport, carry the request, follow redirects, surface cookies and the
//! final URL.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::timeout;
use url::Url;

use crate::cookie::CookieJar;
use crate::error::{Error, Result};
use crate::fingerprint::http2::{Http2Fingerprint, PseudoOrder};
use crate::fingerprint::profiles::ProfileRegistry;
use crate::fingerprint::quic::QuicFingerprint;
use crate::fingerprint::spec::{ConnectionKey, TransportSpec};
use crate::headers;
use crate::pool::{ConnectionPool, Outcome, Transport};
use crate::request::{Protocol, Request, DEFAULT_JA3, MAX_REDIRECTS};
use crate::response::Response;
use crate::tls::handshake::DialTarget;
use crate::transport::connector;
use crate::transport::h2::H2Connection;
use crate::transport::h3::H3Client;
use crate::transport::proxy::ProxyConfig;
use crate::version::HttpVersion;

/// Engine-scoped shared state: the pool. A process-wide default engine
/// lives at the boundary layer only.
pub struct Engine {
    pool: Arc<ConnectionPool>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new()),
        }
    }

    pub fn with_pool(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Close idle pooled connections whose key matches the selector.
    pub async fn close_idle<F>(&self, selector: F)
    where
        F: Fn(&ConnectionKey) -> bool,
    {
        self.pool.close_idle(selector).await;
    }

    /// Run one request under its wall-clock deadline.
    pub async fn execute(&self, request: &Request) -> Result<Response> {
        let deadline = if request.timeout.is_zero() {
            crate::request::DEFAULT_TIMEOUT
        } else {
            request.timeout
        };
        match timeout(deadline, self.execute_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "request deadline of {deadline:?} expired"
            ))),
        }
    }

    async fn execute_inner(&self, request: &Request) -> Result<Response> {
        let resolved = ResolvedRequest::resolve(request)?;
        let mut url = Url::parse(&request.url)?;

        let mut jar = CookieJar::new();
        for cookie in &request.cookies {
            let mut cookie = cookie.clone();
            // Caller-supplied cookies without a domain belong to the
            // request host.
            if cookie.domain.is_empty() {
                cookie.domain = url.host_str().unwrap_or_default().to_ascii_lowercase();
            }
            jar.store(cookie);
        }
        let mut method = request.method.clone();
        let mut body = request.body.clone();

        for _hop in 0..=MAX_REDIRECTS {
            let response = self
                .send_once(&resolved, request, &url, &method, body.as_ref(), &mut jar)
                .await?;

            if response.is_redirect() && !request.disable_redirect {
                let Some(location) = response.header("location") else {
                    return Ok(self.finish(response, &url, jar));
                };
                let next = url
                    .join(location)
                    .map_err(|e| Error::protocol(format!("bad redirect target {location:?}: {e}")))?;

                // 303 always becomes GET; 301/302 demote POST per browser
                // behavior.
                if response.status == 303
                    || ((response.status == 301 || response.status == 302) && method == "POST")
                {
                    method = "GET".to_string();
                    body = None;
                }
                tracing::debug!(from = %url, to = %next, status = response.status, "following redirect");
                url = next;
                continue;
            }

            return Ok(self.finish(response, &url, jar));
        }

        Err(Error::TooManyRedirects { count: MAX_REDIRECTS })
    }

    fn finish(&self, mut response: Response, url: &Url, jar: CookieJar) -> Response {
        response.decompress();
        response.final_url = url.to_string();
        response.cookies = jar.into_cookies();
        response
    }

    /// One hop: acquire a transport for the target and carry the request.
    async fn send_once(
        &self,
        resolved: &ResolvedRequest,
        request: &Request,
        url: &Url,
        method: &str,
        body: Option<&Bytes>,
        jar: &mut CookieJar,
    ) -> Result<Response> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(Error::connection(format!("unsupported scheme {scheme:?}")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::connection("URL missing host"))?
            .to_string();
        let default_port: u16 = if scheme == "https" { 443 } else { 80 };
        let port = url.port().unwrap_or(default_port);
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let wire_headers = resolved.wire_headers(request, url, jar);

        // HTTP/3 carries the request on its own engine-owned UDP socket.
        if resolved.wants_http3(request) {
            let client = H3Client::new(
                resolved.quic.clone(),
                resolved.pseudo_order(),
                !request.insecure_skip_verify,
            );
            let mut response = client
                .send_request(
                    &host,
                    port,
                    request.server_name.as_deref(),
                    &path,
                    method,
                    &wire_headers,
                    body,
                )
                .await?;
            jar.store_response_cookies(&response.headers, url);
            response.version = HttpVersion::Http3;
            return Ok(response);
        }

        let proxy = resolved.proxy.clone();
        let key = ConnectionKey::new(
            scheme,
            &host,
            port,
            &resolved.spec,
            proxy.as_ref().map(|p| p.descriptor()).as_deref(),
            request.server_name.as_deref(),
        );

        let prefer_h2 = !resolved.wants_http1(request);
        let spec = resolved.spec.clone();
        let h2_fingerprint = resolved.http2.clone();
        let target = DialTarget {
            host: host.clone(),
            port,
            server_name: request.server_name.clone(),
            insecure_skip_verify: request.insecure_skip_verify,
            proxy,
        };
        let tls13_auto_retry = request.tls13_auto_retry;
        let scheme_owned = scheme.to_string();

        let lease = self
            .pool
            .acquire(&key, request.enable_connection_reuse, move || async move {
                let dialed =
                    connector::connect(&scheme_owned, &target, &spec, tls13_auto_retry, prefer_h2)
                        .await?;
                match dialed.version {
                    HttpVersion::Http2 => {
                        let conn =
                            H2Connection::connect(dialed.stream, h2_fingerprint.unwrap_or_default())
                                .await?;
                        Ok(Transport::H2(Arc::new(Mutex::new(conn))))
                    }
                    _ => Ok(Transport::H1(crate::transport::h1::H1Connection::new(
                        dialed.stream,
                    ))),
                }
            })
            .await?;

        let (transport, lease_key, pooled) = lease.into_parts();
        let (outcome, transport) = match transport {
            Transport::H1(mut conn) => {
                let result = conn
                    .send_request(method, &host, port, default_port, &path, &wire_headers, body)
                    .await;
                (result, Transport::H1(conn))
            }
            Transport::H2(shared) => {
                let result = {
                    let mut conn = shared.lock().await;
                    conn.send_request(
                        method,
                        scheme,
                        &host_with_port(&host, port, default_port),
                        &path,
                        &wire_headers,
                        body,
                    )
                    .await
                };
                (result, Transport::H2(shared))
            }
        };
        let lease = crate::pool::Lease::from_parts(transport, lease_key, pooled);

        match outcome {
            Ok(response) => {
                self.pool.release(lease, Outcome::Ok).await;
                jar.store_response_cookies(&response.headers, url);
                Ok(response)
            }
            Err(e) => {
                let release_as = if e.breaks_transport() {
                    Outcome::Broken
                } else {
                    Outcome::Ok
                };
                self.pool.release(lease, release_as).await;
                Err(e)
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn host_with_port(host: &str, port: u16, default_port: u16) -> String {
    if port == default_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

/// Fingerprint material and request defaults after profile resolution.
struct ResolvedRequest {
    spec: TransportSpec,
    http2: Option<Http2Fingerprint>,
    quic: QuicFingerprint,
    proxy: Option<ProxyConfig>,
    user_agent: Option<String>,
    header_order: Option<Vec<String>>,
    profile_force_http1: bool,
    profile_force_http3: bool,
}

impl ResolvedRequest {
    fn resolve(request: &Request) -> Result<Self> {
        let profile = match &request.profile {
            Some(name) => Some(ProfileRegistry::global().get(name).ok_or_else(|| {
                Error::fingerprint("profile", 0, format!("unknown profile {name:?}"))
            })?),
            None => None,
        };

        // Explicit request strings override the profile's.
        let ja3 = request
            .ja3
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| profile.as_ref().map(|p| p.ja3.clone()));
        let ja4r = request
            .ja4r
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| profile.as_ref().and_then(|p| p.ja4r.clone()));
        let http2_fp = request
            .http2_fingerprint
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| profile.as_ref().and_then(|p| p.http2_fingerprint.clone()));
        let quic_fp = request
            .quic_fingerprint
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| profile.as_ref().and_then(|p| p.quic_fingerprint.clone()));
        let disable_grease =
            request.disable_grease || profile.as_ref().is_some_and(|p| p.disable_grease);

        // A request with no fingerprint at all still dials with a stable
        // browser identity.
        let ja3 = match (&ja3, &ja4r) {
            (None, None) => Some(DEFAULT_JA3.to_string()),
            _ => ja3,
        };

        let spec = TransportSpec::resolve(
            ja3.as_deref(),
            ja4r.as_deref(),
            http2_fp.as_deref(),
            quic_fp.as_deref(),
            disable_grease,
        )?;

        let proxy = match request.proxy.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(ProxyConfig::parse(raw)?),
            None => None,
        };

        let quic = spec.quic.clone().unwrap_or_default();

        Ok(Self {
            http2: spec.http2.clone(),
            quic,
            spec,
            proxy,
            user_agent: request
                .user_agent
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| profile.as_ref().and_then(|p| p.user_agent.clone())),
            header_order: request
                .header_order
                .clone()
                .or_else(|| profile.as_ref().and_then(|p| p.header_order.clone())),
            profile_force_http1: profile.as_ref().is_some_and(|p| p.force_http1),
            profile_force_http3: profile.as_ref().is_some_and(|p| p.force_http3),
        })
    }

    fn pseudo_order(&self) -> PseudoOrder {
        self.http2
            .as_ref()
            .map(|fp| fp.pseudo_order)
            .unwrap_or_default()
    }

    fn wants_http3(&self, request: &Request) -> bool {
        request.force_http3
            || self.profile_force_http3
            || request.protocol == Some(Protocol::Http3)
    }

    fn wants_http1(&self, request: &Request) -> bool {
        request.force_http1
            || self.profile_force_http1
            || request.protocol == Some(Protocol::Http1)
    }

    /// Final ordered header list for one hop.
    fn wire_headers(&self, request: &Request, url: &Url, jar: &CookieJar) -> Vec<(String, String)> {
        let mut headers = request.headers.clone();
        if let Some(ua) = &self.user_agent {
            headers::set_default(&mut headers, "User-Agent", ua);
        }
        headers::set_default(&mut headers, "Accept-Encoding", "gzip, deflate, br");
        if let Some(cookie_header) = jar.cookie_header(url) {
            // Replaces any caller-supplied Cookie header so jar state wins.
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("cookie"));
            headers.push(("Cookie".to_string(), cookie_header));
        }
        headers::resolve_order(
            headers,
            self.header_order.as_deref(),
            request.order_headers_as_provided,
        )
    }
}
