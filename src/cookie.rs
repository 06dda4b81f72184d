//! Cookie model and mechanical jar semantics.
//!
//! The jar accepts what the server sends and echoes back what it stores;
//! there is no policy layer beyond domain/path/expiry matching.

use chrono::{DateTime, Duration, TimeZone, Utc};
use url::Url;

use crate::error::{Error, Result};

/// SameSite attribute, including the explicit Default the boundary schema
/// distinguishes from absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum SameSite {
    #[default]
    Default,
    Lax,
    Strict,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Lax => "Lax",
            Self::Strict => "Strict",
            Self::None => "None",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "lax" => Self::Lax,
            "strict" => Self::Strict,
            "none" => Self::None,
            _ => Self::Default,
        }
    }
}

/// A cookie with the full attribute set.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// True when no Domain attribute was present (exact-host match only).
    pub host_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: "/".to_string(),
            domain: String::new(),
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: SameSite::Default,
            host_only: true,
        }
    }

    /// Parse a Set-Cookie header against the URL that produced it.
    pub fn from_set_cookie(header: &str, request_url: &Url) -> Result<Self> {
        let mut parts = header.split(';').map(str::trim);
        let first = parts
            .next()
            .ok_or_else(|| Error::CookieParse("empty Set-Cookie".into()))?;
        let (name, value) = first
            .split_once('=')
            .ok_or_else(|| Error::CookieParse(format!("no '=' in {first:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::CookieParse("empty cookie name".into()));
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        cookie.domain = request_url
            .host_str()
            .map(normalize_domain)
            .unwrap_or_default();

        for attr in parts {
            match attr.split_once('=') {
                Some((key, val)) => match key.trim().to_ascii_lowercase().as_str() {
                    "domain" => {
                        cookie.domain = normalize_domain(val.trim());
                        cookie.host_only = false;
                    }
                    "path" => cookie.path = val.trim().to_string(),
                    "expires" => cookie.expires = parse_cookie_date(val.trim()),
                    "max-age" => cookie.max_age = val.trim().parse().ok(),
                    "samesite" => cookie.same_site = SameSite::parse(val.trim()),
                    _ => {}
                },
                None => match attr.to_ascii_lowercase().as_str() {
                    "secure" => cookie.secure = true,
                    "httponly" => cookie.http_only = true,
                    _ => {}
                },
            }
        }

        // Max-Age wins over Expires.
        if let Some(max_age) = cookie.max_age {
            cookie.expires = Some(if max_age > 0 {
                Utc::now() + Duration::seconds(max_age)
            } else {
                Utc::now() - Duration::seconds(1)
            });
        }

        Ok(cookie)
    }

    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|at| at <= Utc::now())
    }

    /// Whether the cookie should ride on a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        if self.is_expired() {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let Some(host) = url.host_str() else { return false };
        let host = host.to_ascii_lowercase();

        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        };
        if !domain_ok {
            return false;
        }

        let path = url.path();
        path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path.as_bytes().get(self.path.len()) == Some(&b'/')))
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_start_matches('.').to_ascii_lowercase()
}

/// Cookie-date parsing per the formats servers actually send.
fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    const FORMATS: [&str; 4] = [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    for format in FORMATS {
        if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&parsed));
        }
    }
    None
}

/// Per-request cookie jar.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie, replacing any with the same (name, domain, path).
    pub fn store(&mut self, cookie: Cookie) {
        self.cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        if !cookie.is_expired() {
            self.cookies.push(cookie);
        }
    }

    /// Absorb every Set-Cookie header from a response.
    pub fn store_response_cookies(&mut self, headers: &[(String, String)], url: &Url) {
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("set-cookie") {
                match Cookie::from_set_cookie(value, url) {
                    Ok(cookie) => self.store(cookie),
                    Err(e) => tracing::debug!("ignoring unparseable cookie: {e}"),
                }
            }
        }
    }

    /// The `Cookie:` header value for a request to `url`, or None.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches(url))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn into_cookies(self) -> Vec<Cookie> {
        self.cookies
    }
}
