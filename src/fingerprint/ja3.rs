//! JA3 fingerprint parsing.
//!
//! A JA3 string is five comma-separated fields: TLS version, cipher suites,
//! extensions, supported groups, and EC point formats. List fields are
//! dash-separated decimal ids.

use crate::error::{Error, Result};

/// Parsed JA3 fingerprint with all id lists in their original order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3Fingerprint {
    pub tls_version: u16,
    pub ciphers: Vec<u16>,
    pub extensions: Vec<u16>,
    pub groups: Vec<u16>,
    pub point_formats: Vec<u8>,
}

impl Ja3Fingerprint {
    /// Parse a JA3 string. Field order and list order are preserved exactly.
    pub fn parse(input: &str) -> Result<Self> {
        let fields: Vec<&str> = input.split(',').collect();
        if fields.len() != 5 {
            return Err(Error::fingerprint(
                "ja3",
                0,
                format!("expected 5 comma-separated fields, got {}", fields.len()),
            ));
        }

        let tls_version = fields[0].trim().parse::<u16>().map_err(|_| {
            Error::fingerprint("ja3.version", 0, format!("invalid TLS version {:?}", fields[0]))
        })?;

        Ok(Self {
            tls_version,
            ciphers: parse_id_list(fields[1], "ja3.ciphers")?,
            extensions: parse_id_list(fields[2], "ja3.extensions")?,
            groups: parse_id_list(fields[3], "ja3.groups")?,
            point_formats: parse_id_list::<u8>(fields[4], "ja3.point_formats")?,
        })
    }

    /// Reassemble the canonical JA3 string from the parsed fields.
    pub fn to_ja3_string(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.tls_version,
            join_ids(&self.ciphers),
            join_ids(&self.extensions),
            join_ids(&self.groups),
            join_ids(&self.point_formats),
        )
    }

    /// MD5 hash of the canonical string, as reported by JA3 services.
    pub fn md5_hash(&self) -> String {
        use md5::{Digest, Md5};
        let digest = Md5::digest(self.to_ja3_string().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

fn parse_id_list<T>(field: &str, name: &'static str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
{
    let field = field.trim();
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split('-')
        .enumerate()
        .map(|(i, part)| {
            part.parse::<T>()
                .map_err(|_| Error::fingerprint(name, i, format!("invalid id {:?}", part)))
        })
        .collect()
}

fn join_ids<T: std::fmt::Display>(ids: &[T]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513,29-23-24,0";

    #[test]
    fn parses_chrome_ja3() {
        let fp = Ja3Fingerprint::parse(CHROME_JA3).unwrap();
        assert_eq!(fp.tls_version, 771);
        assert_eq!(fp.ciphers[0], 4865);
        assert_eq!(fp.ciphers.len(), 15);
        assert_eq!(fp.extensions[0], 0);
        assert_eq!(fp.extensions.last(), Some(&17513));
        assert_eq!(fp.groups, vec![29, 23, 24]);
        assert_eq!(fp.point_formats, vec![0]);
    }

    #[test]
    fn round_trips_exactly() {
        let fp = Ja3Fingerprint::parse(CHROME_JA3).unwrap();
        assert_eq!(fp.to_ja3_string(), CHROME_JA3);
    }

    #[test]
    fn equal_inputs_parse_equal() {
        let a = Ja3Fingerprint::parse(CHROME_JA3).unwrap();
        let b = Ja3Fingerprint::parse(CHROME_JA3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = Ja3Fingerprint::parse("771,1-2,3-4").unwrap_err();
        assert!(matches!(err, Error::FingerprintParse { field: "ja3", .. }));
    }

    #[test]
    fn rejects_non_numeric_cipher() {
        let err = Ja3Fingerprint::parse("771,4865-xyz,0,29,0").unwrap_err();
        match err {
            Error::FingerprintParse { field, position, .. } => {
                assert_eq!(field, "ja3.ciphers");
                assert_eq!(position, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_extension_list_is_allowed() {
        let fp = Ja3Fingerprint::parse("771,4865,,29,0").unwrap();
        assert!(fp.extensions.is_empty());
    }
}
