//! JA4R (raw) fingerprint parsing.
//!
//! JA4R keeps the full ordered hex id lists instead of the hashed JA4 form:
//! `t13d1516h2_<ciphers>_<extensions>_<sigalgs>` where the prefix encodes
//! transport (`t` TCP / `q` QUIC), TLS version digits, SNI marker, cipher
//! and extension counts, and the ALPN tag. List order is significant and is
//! never re-sorted here.

use crate::error::{Error, Result};

/// Transport selector from the JA4R prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ja4Transport {
    Tcp,
    Quic,
}

/// Parsed JA4R fingerprint. Cipher/extension/sigalg order is preserved
/// exactly as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja4Fingerprint {
    pub transport: Ja4Transport,
    /// TLS version as the wire value (0x0304 for 1.3).
    pub tls_version: u16,
    /// True when the prefix carries the `d` (SNI present) marker.
    pub sni_present: bool,
    pub alpn: String,
    pub ciphers: Vec<u16>,
    pub extensions: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
}

impl Ja4Fingerprint {
    /// Parse a JA4R string.
    pub fn parse(input: &str) -> Result<Self> {
        let sections: Vec<&str> = input.split('_').collect();
        if sections.len() != 4 {
            return Err(Error::fingerprint(
                "ja4r",
                0,
                format!("expected 4 underscore-separated sections, got {}", sections.len()),
            ));
        }

        let prefix = sections[0];
        let bytes = prefix.as_bytes();
        // t13d1516h2 = transport, version, sni marker, 2-digit counts, alpn tag
        if bytes.len() < 10 || !prefix.is_ascii() {
            return Err(Error::fingerprint(
                "ja4r.prefix",
                0,
                format!("malformed prefix {:?}", prefix),
            ));
        }

        let transport = match bytes[0] {
            b't' => Ja4Transport::Tcp,
            b'q' => Ja4Transport::Quic,
            other => {
                return Err(Error::fingerprint(
                    "ja4r.prefix",
                    0,
                    format!("unknown transport marker {:?}", other as char),
                ))
            }
        };

        let tls_version = match &prefix[1..3] {
            "13" => 0x0304,
            "12" => 0x0303,
            "11" => 0x0302,
            "10" => 0x0301,
            other => {
                return Err(Error::fingerprint(
                    "ja4r.prefix",
                    1,
                    format!("unknown TLS version digits {:?}", other),
                ))
            }
        };

        let sni_present = match bytes[3] {
            b'd' => true,
            b'i' => false,
            other => {
                return Err(Error::fingerprint(
                    "ja4r.prefix",
                    3,
                    format!("unknown SNI marker {:?}", other as char),
                ))
            }
        };

        // Counts are informational (GREASE slots are excluded from them by
        // some producers); the authoritative lengths are the hex lists.
        for (idx, b) in prefix[4..8].bytes().enumerate() {
            if !b.is_ascii_digit() {
                return Err(Error::fingerprint(
                    "ja4r.prefix",
                    4 + idx,
                    "cipher/extension counts must be decimal digits",
                ));
            }
        }

        let alpn = prefix[8..].to_string();

        Ok(Self {
            transport,
            tls_version,
            sni_present,
            alpn,
            ciphers: parse_hex_list(sections[1], "ja4r.ciphers")?,
            extensions: parse_hex_list(sections[2], "ja4r.extensions")?,
            signature_algorithms: parse_hex_list(sections[3], "ja4r.sigalgs")?,
        })
    }

    /// ALPN protocol list implied by the two-character ALPN tag.
    pub fn alpn_protocols(&self) -> Vec<String> {
        match self.alpn.as_str() {
            "h2" => vec!["h2".to_string(), "http/1.1".to_string()],
            "h1" => vec!["http/1.1".to_string()],
            "h3" => vec!["h3".to_string()],
            _ => Vec::new(),
        }
    }
}

fn parse_hex_list(field: &str, name: &'static str) -> Result<Vec<u16>> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .enumerate()
        .map(|(i, part)| {
            u16::from_str_radix(part.trim(), 16)
                .map_err(|_| Error::fingerprint(name, i, format!("invalid hex id {:?}", part)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_JA4R: &str = "t13d1516h2_1301,1302,1303,c02b,c02f,c02c,c030,cca9,cca8,c013,c014,009c,009d,002f,0035_0000,0017,ff01,000a,000b,0023,0010,0005,000d,0012,0033,002d,002b,001b,4469_0403,0804,0401,0503,0805,0501,0806,0601";

    #[test]
    fn parses_chrome_ja4r() {
        let fp = Ja4Fingerprint::parse(CHROME_JA4R).unwrap();
        assert_eq!(fp.transport, Ja4Transport::Tcp);
        assert_eq!(fp.tls_version, 0x0304);
        assert!(fp.sni_present);
        assert_eq!(fp.alpn, "h2");
        assert_eq!(fp.ciphers[0], 0x1301);
        assert_eq!(fp.ciphers.len(), 15);
        assert_eq!(fp.extensions.len(), 15);
        assert_eq!(fp.extensions.last(), Some(&0x4469));
        assert_eq!(fp.signature_algorithms[0], 0x0403);
    }

    #[test]
    fn preserves_list_order_as_given() {
        // Deliberately unsorted: the parser must not normalize.
        let fp = Ja4Fingerprint::parse("t13d0202h2_1303,1301_0010,0000_0403").unwrap();
        assert_eq!(fp.ciphers, vec![0x1303, 0x1301]);
        assert_eq!(fp.extensions, vec![0x0010, 0x0000]);
    }

    #[test]
    fn quic_transport_marker() {
        let fp = Ja4Fingerprint::parse("q13d0101h3_1301_0000_0403").unwrap();
        assert_eq!(fp.transport, Ja4Transport::Quic);
        assert_eq!(fp.alpn_protocols(), vec!["h3".to_string()]);
    }

    #[test]
    fn rejects_bad_section_count() {
        assert!(Ja4Fingerprint::parse("t13d1516h2_1301,1302").is_err());
    }

    #[test]
    fn rejects_bad_hex() {
        let err = Ja4Fingerprint::parse("t13d0101h2_zzzz_0000_0403").unwrap_err();
        assert!(matches!(err, Error::FingerprintParse { field: "ja4r.ciphers", .. }));
    }
}
