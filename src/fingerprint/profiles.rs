//! Browser fingerprint profiles and the process-wide registry.
//!
//! A profile bundles the fingerprint strings of one browser build together
//! with its request-layer defaults (User-Agent, header order). Profiles are
//! resolved to a [`TransportSpec`] on use; the registry itself only stores
//! the raw strings.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::spec::TransportSpec;

/// Environment variable naming an extra profile directory loaded at init.
pub const PROFILE_DIR_ENV: &str = "WRAITH_PROFILE_DIR";

/// A named browser fingerprint bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub name: String,
    pub ja3: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ja4r: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quic_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_order: Option<Vec<String>>,
    #[serde(default)]
    pub disable_grease: bool,
    #[serde(default)]
    pub force_http1: bool,
    #[serde(default)]
    pub force_http3: bool,
}

impl BrowserProfile {
    /// Resolve the profile's fingerprint strings into a transport spec.
    pub fn to_spec(&self) -> Result<TransportSpec> {
        TransportSpec::resolve(
            Some(self.ja3.as_str()).filter(|s| !s.is_empty()),
            self.ja4r.as_deref(),
            self.http2_fingerprint.as_deref(),
            self.quic_fingerprint.as_deref(),
            self.disable_grease,
        )
    }

    /// Load a single profile from a JSON or YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        if is_yaml {
            serde_yaml::from_str(&data)
                .map_err(|e| Error::Encode(format!("profile {}: {}", path.display(), e)))
        } else {
            serde_json::from_str(&data).map_err(Error::from)
        }
    }
}

/// Registry of profiles keyed by name.
///
/// The default process-wide instance is created lazily on first lookup;
/// built-in profiles load first, then `WRAITH_PROFILE_DIR` when set.
/// Registration goes through a lock; lookups clone the profile out.
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<String, BrowserProfile>>,
}

static GLOBAL_REGISTRY: OnceLock<ProfileRegistry> = OnceLock::new();

impl ProfileRegistry {
    /// Create a registry pre-populated with the built-in browser profiles.
    pub fn with_builtins() -> Self {
        let registry = Self {
            profiles: RwLock::new(HashMap::new()),
        };
        for profile in builtin_profiles() {
            registry.register(profile);
        }
        registry
    }

    /// The process-wide registry (built-ins plus the env-var directory).
    pub fn global() -> &'static Self {
        GLOBAL_REGISTRY.get_or_init(|| {
            let registry = Self::with_builtins();
            if let Ok(dir) = std::env::var(PROFILE_DIR_ENV) {
                if let Err(e) = registry.load_dir(Path::new(&dir)) {
                    tracing::warn!("failed to load profile dir {}: {}", dir, e);
                }
            }
            registry
        })
    }

    /// Register (or replace) a profile.
    pub fn register(&self, profile: BrowserProfile) {
        self.profiles
            .write()
            .expect("profile registry lock poisoned")
            .insert(profile.name.clone(), profile);
    }

    /// Remove a profile; returns true when one was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.profiles
            .write()
            .expect("profile registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Look up a profile by name.
    pub fn get(&self, name: &str) -> Option<BrowserProfile> {
        self.profiles
            .read()
            .expect("profile registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .profiles
            .read()
            .expect("profile registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Load every `*.json` / `*.yaml` / `*.yml` file from a directory in
    /// lexicographic order; later files supersede earlier same-named
    /// entries.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "json" | "yaml" | "yml"))
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match BrowserProfile::from_file(&path) {
                Ok(profile) => {
                    self.register(profile);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("skipping profile file {}: {}", path.display(), e);
                }
            }
        }
        Ok(loaded)
    }

    /// Clear all entries (teardown / tests).
    pub fn clear(&self) {
        self.profiles
            .write()
            .expect("profile registry lock poisoned")
            .clear();
    }
}

const CHROME_HEADER_ORDER: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "upgrade-insecure-requests",
    "user-agent",
    "accept",
    "sec-fetch-site",
    "sec-fetch-mode",
    "sec-fetch-user",
    "sec-fetch-dest",
    "accept-encoding",
    "accept-language",
    "cookie",
];

const SAFARI_HEADER_ORDER: &[&str] = &[
    "host",
    "accept",
    "sec-fetch-site",
    "cookie",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "user-agent",
    "accept-language",
    "accept-encoding",
    "connection",
];

fn owned(list: &[&str]) -> Option<Vec<String>> {
    Some(list.iter().map(|s| s.to_string()).collect())
}

/// Built-in browser profiles.
fn builtin_profiles() -> Vec<BrowserProfile> {
    let chrome_ja3 = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513,29-23-24,0";
    let chrome_h2 = "1:65536;2:0;3:1000;4:6291456;6:262144|15663105|0|m,a,s,p";
    let safari_ja3 = "771,4865-4866-4867-49196-49195-52393-49200-49199-52392-49162-49161-49172-49171-157-156-53-47-49160-49170-10,0-23-65281-10-11-16-5-13-18-51-45-43-27,29-23-24-25,0";
    let safari_h2 = "4:4194304;3:100|10485760|0|m,s,p,a";

    vec![
        BrowserProfile {
            name: "chrome_120".to_string(),
            ja3: chrome_ja3.to_string(),
            ja4r: None,
            http2_fingerprint: Some(chrome_h2.to_string()),
            quic_fingerprint: None,
            user_agent: Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()),
            header_order: owned(CHROME_HEADER_ORDER),
            disable_grease: false,
            force_http1: false,
            force_http3: false,
        },
        BrowserProfile {
            name: "chrome_121".to_string(),
            ja3: "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0".to_string(),
            ja4r: None,
            http2_fingerprint: Some(chrome_h2.to_string()),
            quic_fingerprint: None,
            user_agent: Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".to_string()),
            header_order: owned(CHROME_HEADER_ORDER),
            disable_grease: false,
            force_http1: false,
            force_http3: false,
        },
        BrowserProfile {
            name: "firefox_121".to_string(),
            ja3: "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-34-51-43-13-45-28-21,29-23-24-25-256-257,0".to_string(),
            ja4r: None,
            http2_fingerprint: Some("1:65536;4:131072;5:16384|12517377|3:0:0:201,5:0:0:101,7:0:0:1,9:0:7:1,11:0:3:1,13:0:0:241|m,p,a,s".to_string()),
            quic_fingerprint: None,
            user_agent: Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string()),
            header_order: owned(&[
                "host",
                "user-agent",
                "accept",
                "accept-language",
                "accept-encoding",
                "connection",
                "cookie",
                "upgrade-insecure-requests",
                "sec-fetch-dest",
                "sec-fetch-mode",
                "sec-fetch-site",
                "sec-fetch-user",
            ]),
            disable_grease: true,
            force_http1: false,
            force_http3: false,
        },
        BrowserProfile {
            name: "safari_17".to_string(),
            ja3: safari_ja3.to_string(),
            ja4r: None,
            http2_fingerprint: Some(safari_h2.to_string()),
            quic_fingerprint: None,
            user_agent: Some("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15".to_string()),
            header_order: owned(SAFARI_HEADER_ORDER),
            disable_grease: false,
            force_http1: false,
            force_http3: false,
        },
        BrowserProfile {
            name: "edge_120".to_string(),
            ja3: chrome_ja3.to_string(),
            ja4r: None,
            http2_fingerprint: Some(chrome_h2.to_string()),
            quic_fingerprint: None,
            user_agent: Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0".to_string()),
            header_order: owned(CHROME_HEADER_ORDER),
            disable_grease: false,
            force_http1: false,
            force_http3: false,
        },
        BrowserProfile {
            name: "chrome_android".to_string(),
            ja3: chrome_ja3.to_string(),
            ja4r: None,
            http2_fingerprint: Some(chrome_h2.to_string()),
            quic_fingerprint: None,
            user_agent: Some("Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.43 Mobile Safari/537.36".to_string()),
            header_order: owned(CHROME_HEADER_ORDER),
            disable_grease: false,
            force_http1: false,
            force_http3: false,
        },
        BrowserProfile {
            name: "safari_ios".to_string(),
            ja3: safari_ja3.to_string(),
            ja4r: None,
            http2_fingerprint: Some(safari_h2.to_string()),
            quic_fingerprint: None,
            user_agent: Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1".to_string()),
            header_order: owned(SAFARI_HEADER_ORDER),
            disable_grease: false,
            force_http1: false,
            force_http3: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = ProfileRegistry::with_builtins();
        for name in ["chrome_120", "firefox_121", "safari_17", "edge_120"] {
            assert!(registry.get(name).is_some(), "missing builtin {name}");
        }
    }

    #[test]
    fn builtins_resolve_to_specs() {
        let registry = ProfileRegistry::with_builtins();
        for name in registry.names() {
            let profile = registry.get(&name).unwrap();
            let spec = profile.to_spec().unwrap_or_else(|e| panic!("{name}: {e}"));
            assert!(!spec.ciphers.is_empty());
            if profile.http2_fingerprint.is_some() {
                assert!(spec.http2.is_some());
            }
        }
    }

    #[test]
    fn register_replaces_same_name() {
        let registry = ProfileRegistry::with_builtins();
        let mut custom = registry.get("chrome_120").unwrap();
        custom.user_agent = Some("custom/1.0".to_string());
        registry.register(custom);
        assert_eq!(
            registry.get("chrome_120").unwrap().user_agent.as_deref(),
            Some("custom/1.0")
        );
    }

    #[test]
    fn dir_loading_is_lexicographic() {
        let dir = std::env::temp_dir().join(format!("wraith-profiles-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("10_first.json"),
            r#"{"name":"custom","ja3":"771,4865,0-43,29,0","user_agent":"first"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("20_second.json"),
            r#"{"name":"custom","ja3":"771,4865,0-43,29,0","user_agent":"second"}"#,
        )
        .unwrap();

        let registry = ProfileRegistry::with_builtins();
        let loaded = registry.load_dir(&dir).unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(
            registry.get("custom").unwrap().user_agent.as_deref(),
            Some("second")
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
