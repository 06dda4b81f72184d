//! HTTP/2 fingerprint parsing (Akamai format).
//!
//! The Akamai fingerprint is `settings|window_update|priority|pseudo_order`:
//!
//! - `settings`: `k:v` pairs joined by `;` (the original producer used `,`;
//!   both are accepted), insertion order preserved. Settings absent from the
//!   fingerprint are NOT written to the wire at all — the peer falls back to
//!   RFC 7540 defaults. This omission is deliberate: writing defaults would
//!   change the observable SETTINGS frame.
//! - `window_update`: decimal connection-level WINDOW_UPDATE increment,
//!   `0` meaning none beyond the protocol default.
//! - `priority`: `0` for none, or a comma-joined list of
//!   `streamID:exclusive:depends:weight` entries. The first entry also
//!   populates the HEADERS frame priority fields; every entry is emitted as
//!   a PRIORITY frame after the connection handshake.
//! - `pseudo_order`: permutation of `m,p,a,s` (`:method`, `:path`,
//!   `:authority`, `:scheme`).

use crate::error::{Error, Result};

/// One of the four HTTP/2 request pseudo-headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoHeader {
    Method,
    Path,
    Authority,
    Scheme,
}

impl PseudoHeader {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Method => ":method",
            Self::Path => ":path",
            Self::Authority => ":authority",
            Self::Scheme => ":scheme",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "m" => Some(Self::Method),
            "p" => Some(Self::Path),
            "a" => Some(Self::Authority),
            "s" => Some(Self::Scheme),
            _ => None,
        }
    }
}

/// Pseudo-header emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PseudoOrder(pub [PseudoHeader; 4]);

impl Default for PseudoOrder {
    /// Chrome order: m,a,s,p is the classic Akamai default; Chrome itself
    /// sends m,s,a,p on the wire, which is what we default to.
    fn default() -> Self {
        Self([
            PseudoHeader::Method,
            PseudoHeader::Scheme,
            PseudoHeader::Authority,
            PseudoHeader::Path,
        ])
    }
}

impl PseudoOrder {
    /// Parse a comma-joined permutation of `m,p,a,s`.
    pub fn parse(field: &str) -> Result<Self> {
        let tags: Vec<&str> = field.split(',').map(str::trim).collect();
        if tags.len() != 4 {
            return Err(Error::fingerprint(
                "http2.pseudo_order",
                0,
                format!("expected 4 entries, got {}", tags.len()),
            ));
        }
        let mut order = [PseudoHeader::Method; 4];
        let mut seen = [false; 4];
        for (i, tag) in tags.iter().enumerate() {
            let ph = PseudoHeader::from_tag(tag).ok_or_else(|| {
                Error::fingerprint("http2.pseudo_order", i, format!("unknown tag {:?}", tag))
            })?;
            let slot = ph as usize;
            if seen[slot] {
                return Err(Error::fingerprint(
                    "http2.pseudo_order",
                    i,
                    format!("duplicate tag {:?}", tag),
                ));
            }
            seen[slot] = true;
            order[i] = ph;
        }
        Ok(Self(order))
    }

    /// Akamai tag string (`m,s,a,p` style).
    pub fn akamai_string(&self) -> String {
        self.0
            .iter()
            .map(|p| match p {
                PseudoHeader::Method => "m",
                PseudoHeader::Path => "p",
                PseudoHeader::Authority => "a",
                PseudoHeader::Scheme => "s",
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A stream priority declaration from the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamPriority {
    pub stream_id: u32,
    pub exclusive: bool,
    pub depends_on: u32,
    pub weight: u8,
}

/// Parsed HTTP/2 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Http2Fingerprint {
    /// SETTINGS entries in exact wire order. Entries not listed here are
    /// omitted from the SETTINGS frame, not defaulted.
    pub settings: Vec<(u16, u32)>,
    /// Connection-level WINDOW_UPDATE increment; 0 means none is sent.
    pub window_update: u32,
    /// PRIORITY declarations; empty means no priority signalling.
    pub priorities: Vec<StreamPriority>,
    /// Pseudo-header order for every request on the connection.
    pub pseudo_order: PseudoOrder,
}

impl Http2Fingerprint {
    /// Parse an Akamai-format fingerprint string.
    pub fn parse(input: &str) -> Result<Self> {
        let sections: Vec<&str> = input.split('|').collect();
        if sections.len() != 4 {
            return Err(Error::fingerprint(
                "http2",
                0,
                format!("expected 4 pipe-separated sections, got {}", sections.len()),
            ));
        }

        Ok(Self {
            settings: parse_settings(sections[0])?,
            window_update: sections[1].trim().parse::<u32>().map_err(|_| {
                Error::fingerprint(
                    "http2.window_update",
                    0,
                    format!("invalid increment {:?}", sections[1]),
                )
            })?,
            priorities: parse_priorities(sections[2])?,
            pseudo_order: PseudoOrder::parse(sections[3])?,
        })
    }

    /// HEADERS frame priority fields: the first declared priority, if any.
    pub fn headers_priority(&self) -> Option<StreamPriority> {
        self.priorities.first().copied()
    }
}

fn parse_settings(field: &str) -> Result<Vec<(u16, u32)>> {
    let field = field.trim();
    if field.is_empty() || field == "0" {
        return Ok(Vec::new());
    }
    let sep = if field.contains(';') { ';' } else { ',' };
    field
        .split(sep)
        .enumerate()
        .map(|(i, pair)| {
            let (k, v) = pair.trim().split_once(':').ok_or_else(|| {
                Error::fingerprint("http2.settings", i, format!("missing ':' in {:?}", pair))
            })?;
            let key = k.trim().parse::<u16>().map_err(|_| {
                Error::fingerprint("http2.settings", i, format!("invalid key {:?}", k))
            })?;
            let value = v.trim().parse::<u32>().map_err(|_| {
                Error::fingerprint("http2.settings", i, format!("invalid value {:?}", v))
            })?;
            Ok((key, value))
        })
        .collect()
}

fn parse_priorities(field: &str) -> Result<Vec<StreamPriority>> {
    let field = field.trim();
    if field.is_empty() || field == "0" {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .enumerate()
        .map(|(i, entry)| {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            if parts.len() != 4 {
                return Err(Error::fingerprint(
                    "http2.priority",
                    i,
                    format!("expected streamID:exclusive:depends:weight, got {:?}", entry),
                ));
            }
            let parse_u32 = |s: &str| {
                s.trim().parse::<u32>().map_err(|_| {
                    Error::fingerprint("http2.priority", i, format!("invalid number {:?}", s))
                })
            };
            let weight = parts[3].trim().parse::<u16>().map_err(|_| {
                Error::fingerprint("http2.priority", i, format!("invalid weight {:?}", parts[3]))
            })?;
            if weight == 0 || weight > 256 {
                return Err(Error::fingerprint(
                    "http2.priority",
                    i,
                    format!("weight {} out of range 1..=256", weight),
                ));
            }
            Ok(StreamPriority {
                stream_id: parse_u32(parts[0])?,
                exclusive: parse_u32(parts[1])? != 0,
                depends_on: parse_u32(parts[2])?,
                // Wire weight is value-1 per RFC 9113.
                weight: (weight - 1) as u8,
            })
        })
        .collect()
}
