//! ClientHello synthesis from a transport spec.
//!
//! The synthesizer turns the immutable [`TransportSpec`] into a concrete
//! [`ClientHello`] for one handshake: GREASE slots get fresh values drawn
//! from the canonical set, context-dependent extensions are tagged for
//! live materialization against the dial target, and the version range is
//! validated against the cipher list.

use getrandom::getrandom;

use crate::error::{Error, Result};
use crate::fingerprint::spec::{
    is_grease, is_tls13_cipher, ExtensionEntry, ExtensionPayload, TransportSpec, TLS1_2, TLS1_3,
};

/// The canonical GREASE value set (RFC 8701).
pub const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// A synthesized ClientHello for a single handshake attempt.
///
/// All GREASE slots are already materialized; equality of two hellos from
/// the same spec is therefore only guaranteed when GREASE is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub min_version: u16,
    pub max_version: u16,
    /// Final wire-order cipher list.
    pub ciphers: Vec<u16>,
    /// Final wire-order extension list.
    pub extensions: Vec<ExtensionEntry>,
    pub groups: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub point_formats: Vec<u8>,
    pub alpn: Vec<String>,
    pub key_share_groups: Vec<u16>,
    /// True when any GREASE slot was emitted (drives the TLS backend's
    /// GREASE mode).
    pub grease_enabled: bool,
}

/// Draws per-handshake GREASE values, each slot distinct from the last.
struct GreaseDealer {
    offset: usize,
    dealt: usize,
}

impl GreaseDealer {
    fn new() -> Result<Self> {
        let mut seed = [0u8; 1];
        getrandom(&mut seed).map_err(|e| Error::tls(format!("grease rng: {e}"), vec![]))?;
        Ok(Self {
            offset: seed[0] as usize % GREASE_VALUES.len(),
            dealt: 0,
        })
    }

    fn next(&mut self) -> u16 {
        // Stride 3 keeps consecutive slots distinct across the whole set.
        let value = GREASE_VALUES[(self.offset + self.dealt * 3) % GREASE_VALUES.len()];
        self.dealt += 1;
        value
    }
}

/// Synthesize a ClientHello from a spec.
pub fn synthesize(spec: &TransportSpec) -> Result<ClientHello> {
    validate(spec)?;

    let mut dealer = GreaseDealer::new()?;
    let mut grease_enabled = false;

    let mut ciphers = Vec::with_capacity(spec.ciphers.len());
    for &id in &spec.ciphers {
        if is_grease(id) {
            if spec.disable_grease {
                continue;
            }
            grease_enabled = true;
            ciphers.push(dealer.next());
        } else {
            ciphers.push(id);
        }
    }

    let mut extensions = Vec::with_capacity(spec.extensions.len());
    for entry in &spec.extensions {
        match entry.payload {
            ExtensionPayload::Grease => {
                if spec.disable_grease {
                    continue;
                }
                grease_enabled = true;
                extensions.push(ExtensionEntry {
                    id: dealer.next(),
                    payload: ExtensionPayload::Grease,
                });
            }
            _ => extensions.push(entry.clone()),
        }
    }

    let mut groups = Vec::with_capacity(spec.groups.len());
    for &id in &spec.groups {
        if is_grease(id) {
            if spec.disable_grease {
                continue;
            }
            grease_enabled = true;
            groups.push(dealer.next());
        } else {
            groups.push(id);
        }
    }

    Ok(ClientHello {
        min_version: spec.min_version,
        max_version: spec.max_version,
        ciphers,
        extensions,
        groups,
        signature_algorithms: spec.signature_algorithms.clone(),
        point_formats: spec.point_formats.clone(),
        alpn: spec.alpn.clone(),
        key_share_groups: spec.key_share_groups.clone(),
        grease_enabled,
    })
}

/// Reject specs whose pieces contradict each other.
fn validate(spec: &TransportSpec) -> Result<()> {
    if spec.min_version > spec.max_version {
        return Err(Error::SpecIncoherent(format!(
            "min version {:#06x} above max version {:#06x}",
            spec.min_version, spec.max_version
        )));
    }

    if spec.max_version < TLS1_3 {
        if let Some(&id) = spec.ciphers.iter().find(|&&id| is_tls13_cipher(id)) {
            return Err(Error::SpecIncoherent(format!(
                "TLS 1.3 cipher {:#06x} requires max version 1.3, spec caps at {:#06x}",
                id, spec.max_version
            )));
        }
    }

    let real_ciphers = spec.ciphers.iter().filter(|&&id| !is_grease(id)).count();
    if real_ciphers == 0 {
        return Err(Error::SpecIncoherent("cipher list has no real entries".into()));
    }

    Ok(())
}

impl ClientHello {
    /// Recompute the JA3 string this hello would produce on the wire.
    ///
    /// GREASE slots keep their positions but their materialized values are
    /// included, so this equals the source JA3 exactly only when GREASE is
    /// disabled.
    pub fn ja3_string(&self) -> String {
        let version = if self.max_version >= TLS1_3 { 771 } else { self.max_version };
        let join16 = |ids: &[u16]| {
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join("-")
        };
        format!(
            "{},{},{},{},{}",
            version,
            join16(&self.ciphers),
            join16(&self.extensions.iter().map(|e| e.id).collect::<Vec<_>>()),
            join16(&self.groups),
            self.point_formats
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join("-"),
        )
    }

    /// ALPN protocols as the length-prefixed wire encoding boring expects.
    pub fn alpn_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for proto in &self.alpn {
            out.push(proto.len() as u8);
            out.extend_from_slice(proto.as_bytes());
        }
        out
    }
}

/// Offered versions for the error path: which protocol versions a hello
/// covers, newest first.
pub fn offered_versions(hello: &ClientHello) -> Vec<&'static str> {
    let mut versions = Vec::new();
    if hello.max_version >= TLS1_3 {
        versions.push("TLS1.3");
    }
    if hello.min_version <= TLS1_2 {
        versions.push("TLS1.2");
    }
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ja3::Ja3Fingerprint;

    const CHROME_JA3: &str = "771,4865-4866-4867-49195-49199,0-23-65281-10-11-35-16-5-13-51-45-43,29-23-24,0";

    fn chrome_spec(disable_grease: bool) -> TransportSpec {
        let ja3 = Ja3Fingerprint::parse(CHROME_JA3).unwrap();
        TransportSpec::from_ja3(&ja3, disable_grease)
    }

    #[test]
    fn preserves_cipher_and_extension_order() {
        let spec = chrome_spec(true);
        let hello = synthesize(&spec).unwrap();
        assert_eq!(hello.ciphers, spec.ciphers);
        let ids: Vec<u16> = hello.extensions.iter().map(|e| e.id).collect();
        let expected: Vec<u16> = spec.extensions.iter().map(|e| e.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn disable_grease_reproduces_ja3_exactly() {
        let spec = chrome_spec(true);
        let hello = synthesize(&spec).unwrap();
        assert!(!hello.grease_enabled);
        assert_eq!(hello.ja3_string(), CHROME_JA3);
    }

    #[test]
    fn grease_slots_get_distinct_canonical_values() {
        let ja3 = Ja3Fingerprint::parse(
            "771,2570-4865-4866,2570-0-10-11-43-51-2570,2570-29-23,0",
        )
        .unwrap();
        let spec = TransportSpec::from_ja3(&ja3, false);
        let hello = synthesize(&spec).unwrap();
        assert!(hello.grease_enabled);

        let mut dealt = Vec::new();
        dealt.push(hello.ciphers[0]);
        dealt.push(hello.extensions[0].id);
        dealt.push(hello.extensions.last().unwrap().id);
        dealt.push(hello.groups[0]);
        for v in &dealt {
            assert!(is_grease(*v), "{v:#06x} not a GREASE value");
            assert!(GREASE_VALUES.contains(v));
        }
        // All four slots distinct within one handshake.
        let mut unique = dealt.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), dealt.len());
    }

    #[test]
    fn grease_slots_are_omitted_when_disabled() {
        let ja3 = Ja3Fingerprint::parse(
            "771,2570-4865-4866,2570-0-10-11-43-51,29-23,0",
        )
        .unwrap();
        let spec = TransportSpec::from_ja3(&ja3, true);
        let hello = synthesize(&spec).unwrap();
        assert_eq!(hello.ciphers, vec![4865, 4866]);
        assert_eq!(hello.extensions[0].id, 0);
        assert!(!hello.grease_enabled);
    }

    #[test]
    fn grease_randomizes_per_handshake_not_per_parse() {
        let ja3 = Ja3Fingerprint::parse(
            "771,2570-4865,2570-0-10-11-43-51,29,0",
        )
        .unwrap();
        let spec = TransportSpec::from_ja3(&ja3, false);
        // The spec itself keeps the symbolic slot.
        assert!(is_grease(spec.ciphers[0]));

        // Over many draws the materialized value varies.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            seen.insert(synthesize(&spec).unwrap().ciphers[0]);
        }
        assert!(seen.len() > 1, "GREASE value never varied");
    }

    #[test]
    fn tls13_cipher_with_tls12_cap_is_incoherent() {
        let mut spec = chrome_spec(false);
        spec.max_version = TLS1_2;
        let err = synthesize(&spec).unwrap_err();
        assert!(matches!(err, Error::SpecIncoherent(_)));
    }

    #[test]
    fn all_grease_cipher_list_is_incoherent() {
        let mut spec = chrome_spec(false);
        spec.ciphers = vec![0x0a0a, 0x1a1a];
        assert!(matches!(synthesize(&spec), Err(Error::SpecIncoherent(_))));
    }
}
