//! HTTP/2 frame codec (RFC 9113).
//!
//! Serialization keeps full control of frame content and ordering: the
//! SETTINGS frame writes entries exactly as the fingerprint lists them, and
//! HEADERS can carry the fingerprint's priority fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size (9 bytes).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Client connection preface.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Frame type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        match t {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Parsed 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id: ((buf[5] as u32 & 0x7f) << 24)
                | ((buf[6] as u32) << 16)
                | ((buf[7] as u32) << 8)
                | buf[8] as u32,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

/// SETTINGS frame whose entries go to the wire in insertion order.
#[derive(Debug, Clone, Default)]
pub struct SettingsFrame {
    pub entries: Vec<(u16, u32)>,
    pub ack: bool,
}

impl SettingsFrame {
    pub fn with_entries(entries: Vec<(u16, u32)>) -> Self {
        Self { entries, ack: false }
    }

    pub fn ack() -> Self {
        Self {
            entries: Vec::new(),
            ack: true,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let payload = if self.ack { 0 } else { self.entries.len() * 6 };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload);
        FrameHeader {
            length: payload as u32,
            frame_type: FrameType::Settings,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        }
        .encode(&mut buf);
        if !self.ack {
            for (id, value) in &self.entries {
                buf.put_u16(*id);
                buf.put_u32(*value);
            }
        }
        buf
    }

    pub fn parse(flags: u8, mut payload: Bytes) -> Self {
        let ack = flags & flags::ACK != 0;
        let mut entries = Vec::new();
        while payload.remaining() >= 6 {
            entries.push((payload.get_u16(), payload.get_u32()));
        }
        Self { entries, ack }
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        FrameHeader {
            length: 4,
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id: self.stream_id,
        }
        .encode(&mut buf);
        buf.put_u32(self.increment & 0x7fff_ffff);
        buf
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Option<Self> {
        if payload.remaining() < 4 {
            return None;
        }
        let increment = payload.get_u32() & 0x7fff_ffff;
        if increment == 0 {
            return None;
        }
        Some(Self { stream_id, increment })
    }
}

/// Priority fields carried by HEADERS or a PRIORITY frame.
#[derive(Debug, Clone, Copy)]
pub struct PriorityFields {
    pub exclusive: bool,
    pub depends_on: u32,
    pub weight: u8,
}

impl PriorityFields {
    fn encode_into(&self, buf: &mut BytesMut) {
        let dep = if self.exclusive {
            self.depends_on | 0x8000_0000
        } else {
            self.depends_on
        };
        buf.put_u32(dep);
        buf.put_u8(self.weight);
    }
}

/// Standalone PRIORITY frame.
#[derive(Debug, Clone, Copy)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub fields: PriorityFields,
}

impl PriorityFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
        FrameHeader {
            length: 5,
            frame_type: FrameType::Priority,
            flags: 0,
            stream_id: self.stream_id,
        }
        .encode(&mut buf);
        self.fields.encode_into(&mut buf);
        buf
    }
}

/// HEADERS frame carrying an already-encoded block.
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub block: Bytes,
    pub end_stream: bool,
    pub priority: Option<PriorityFields>,
}

impl HeadersFrame {
    pub fn encode(&self) -> BytesMut {
        let priority_len = if self.priority.is_some() { 5 } else { 0 };
        let payload = priority_len + self.block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload);

        let mut frame_flags = flags::END_HEADERS;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if self.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }

        FrameHeader {
            length: payload as u32,
            frame_type: FrameType::Headers,
            flags: frame_flags,
            stream_id: self.stream_id,
        }
        .encode(&mut buf);

        if let Some(priority) = &self.priority {
            priority.encode_into(&mut buf);
        }
        buf.extend_from_slice(&self.block);
        buf
    }

    /// Strip padding and priority from a received HEADERS payload, leaving
    /// the header block fragment.
    pub fn strip_payload(flags_byte: u8, mut payload: Bytes) -> Option<Bytes> {
        let padded = flags_byte & flags::PADDED != 0;
        let prioritized = flags_byte & flags::PRIORITY != 0;

        let pad_len = if padded {
            if payload.remaining() < 1 {
                return None;
            }
            payload.get_u8() as usize
        } else {
            0
        };
        if prioritized {
            if payload.remaining() < 5 {
                return None;
            }
            payload.advance(5);
        }
        if payload.remaining() < pad_len {
            return None;
        }
        let block_len = payload.remaining() - pad_len;
        Some(payload.slice(..block_len))
    }
}

/// DATA frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
}

impl DataFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.data.len());
        FrameHeader {
            length: self.data.len() as u32,
            frame_type: FrameType::Data,
            flags: if self.end_stream { flags::END_STREAM } else { 0 },
            stream_id: self.stream_id,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn strip_payload(flags_byte: u8, mut payload: Bytes) -> Option<Bytes> {
        if flags_byte & flags::PADDED != 0 {
            if payload.remaining() < 1 {
                return None;
            }
            let pad = payload.get_u8() as usize;
            if payload.remaining() < pad {
                return None;
            }
            let len = payload.remaining() - pad;
            Some(payload.slice(..len))
        } else {
            Some(payload)
        }
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: u32,
}

impl RstStreamFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        FrameHeader {
            length: 4,
            frame_type: FrameType::RstStream,
            flags: 0,
            stream_id: self.stream_id,
        }
        .encode(&mut buf);
        buf.put_u32(self.error_code);
        buf
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Option<Self> {
        if payload.remaining() < 4 {
            return None;
        }
        Some(Self {
            stream_id,
            error_code: payload.get_u32(),
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: u32,
}

impl GoAwayFrame {
    pub fn parse(mut payload: Bytes) -> Option<Self> {
        if payload.remaining() < 8 {
            return None;
        }
        Some(Self {
            last_stream_id: payload.get_u32() & 0x7fff_ffff,
            error_code: payload.get_u32(),
        })
    }
}

/// PING frame (8-byte opaque payload).
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub payload: [u8; 8],
    pub ack: bool,
}

impl PingFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        FrameHeader {
            length: 8,
            frame_type: FrameType::Ping,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn parse(flags_byte: u8, payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&payload[..8]);
        Some(Self {
            payload: data,
            ack: flags_byte & flags::ACK != 0,
        })
    }
}
