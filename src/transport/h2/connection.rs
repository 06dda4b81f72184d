//! HTTP/2 connection with fingerprint-shaped preface.
//!
//! The handshake writes the client preface, a SETTINGS frame whose entries
//! are exactly the fingerprint's (absent settings are absent on the wire),
//! an optional connection-level WINDOW_UPDATE, and any PRIORITY frames the
//! fingerprint declares, all in one write. The preface is written once per
//! connection lifetime; requests reuse the connection afterwards.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::fingerprint::http2::Http2Fingerprint;
use crate::response::Response;
use crate::version::HttpVersion;

use super::frame::{
    flags, DataFrame, FrameHeader, FrameType, GoAwayFrame, HeadersFrame, PingFrame,
    PriorityFields, PriorityFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame,
    CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE,
};
use super::hpack::{Decoder, RequestEncoder};

const DEFAULT_WINDOW: i64 = 65535;
/// Replenish the stream window once consumption passes this threshold.
const WINDOW_REFILL_THRESHOLD: i64 = 32768;

/// One HTTP/2 connection; requests run sequentially on it, stream ids
/// assigned in submission order.
pub struct H2Connection<S> {
    stream: S,
    encoder: RequestEncoder,
    decoder: Decoder,
    fingerprint: Http2Fingerprint,
    next_stream_id: u32,
    read_buf: BytesMut,
    conn_send_window: i64,
    peer_initial_window: i64,
    peer_max_frame_size: usize,
    goaway_last_stream: Option<u32>,
    broken: bool,
    /// True while a request is on the wire. A cancelled caller drops the
    /// send future with this still set, which marks the connection
    /// unusable for reuse (the stream may be mid-frame).
    mid_stream: bool,
}

impl<S> H2Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Perform the fingerprinted HTTP/2 handshake.
    pub async fn connect(mut stream: S, fingerprint: Http2Fingerprint) -> Result<Self> {
        let mut handshake = BytesMut::with_capacity(256);
        handshake.extend_from_slice(CONNECTION_PREFACE);
        handshake.extend_from_slice(&SettingsFrame::with_entries(fingerprint.settings.clone()).encode());

        if fingerprint.window_update > 0 {
            handshake.extend_from_slice(
                &WindowUpdateFrame {
                    stream_id: 0,
                    increment: fingerprint.window_update,
                }
                .encode(),
            );
        }

        // Multi-entry priority lists describe the browser's idle stream
        // tree; a single entry instead rides on the request HEADERS.
        if fingerprint.priorities.len() > 1 {
            for priority in &fingerprint.priorities {
                handshake.extend_from_slice(
                    &PriorityFrame {
                        stream_id: priority.stream_id,
                        fields: PriorityFields {
                            exclusive: priority.exclusive,
                            depends_on: priority.depends_on,
                            weight: priority.weight,
                        },
                    }
                    .encode(),
                );
            }
        }

        stream
            .write_all(&handshake)
            .await
            .map_err(|e| Error::protocol(format!("h2 handshake write: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::protocol(format!("h2 handshake flush: {e}")))?;

        // Browsers do not wait for the server SETTINGS before the first
        // request; it is consumed while reading the response.
        let encoder = RequestEncoder::new(fingerprint.pseudo_order);

        Ok(Self {
            stream,
            encoder,
            decoder: Decoder::new(),
            fingerprint,
            next_stream_id: 1,
            read_buf: BytesMut::with_capacity(16384),
            conn_send_window: DEFAULT_WINDOW,
            peer_initial_window: DEFAULT_WINDOW,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
            goaway_last_stream: None,
            broken: false,
            mid_stream: false,
        })
    }

    /// Whether the connection can take another request.
    pub fn reusable(&self) -> bool {
        !self.broken && self.goaway_last_stream.is_none() && !self.mid_stream
    }

    /// Send one request and read its response.
    pub async fn send_request(
        &mut self,
        method: &str,
        scheme: &str,
        authority: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&Bytes>,
    ) -> Result<Response> {
        if !self.reusable() {
            return Err(Error::protocol("h2 connection is closed"));
        }
        self.mid_stream = true;

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let block = self
            .encoder
            .encode_request(method, scheme, authority, path, headers);

        let headers_priority = if self.fingerprint.priorities.len() == 1 {
            self.fingerprint.headers_priority().map(|p| PriorityFields {
                exclusive: p.exclusive,
                depends_on: p.depends_on,
                weight: p.weight,
            })
        } else {
            None
        };

        let headers_frame = HeadersFrame {
            stream_id,
            block,
            end_stream: body.is_none(),
            priority: headers_priority,
        };

        let result = self.exchange(stream_id, headers_frame, body).await;
        self.mid_stream = false;
        if let Err(e) = &result {
            if e.breaks_transport() {
                self.broken = true;
            }
        }
        result
    }

    async fn exchange(
        &mut self,
        stream_id: u32,
        headers_frame: HeadersFrame,
        body: Option<&Bytes>,
    ) -> Result<Response> {
        self.write_all(&headers_frame.encode()).await?;
        if let Some(body) = body {
            self.send_body(stream_id, body).await?;
        }
        self.stream
            .flush()
            .await
            .map_err(|e| Error::protocol(format!("h2 flush: {e}")))?;

        self.read_response(stream_id).await
    }

    async fn send_body(&mut self, stream_id: u32, body: &Bytes) -> Result<()> {
        let mut offset = 0usize;
        let mut stream_window = self.peer_initial_window;

        while offset < body.len() {
            while self.conn_send_window <= 0 || stream_window <= 0 {
                self.pump_one_frame(stream_id, &mut stream_window).await?;
            }
            let budget = self
                .peer_max_frame_size
                .min(self.conn_send_window as usize)
                .min(stream_window as usize);
            let end = (offset + budget).min(body.len());
            let chunk = body.slice(offset..end);
            let len = chunk.len() as i64;
            let frame = DataFrame {
                stream_id,
                data: chunk,
                end_stream: end == body.len(),
            };
            self.write_all(&frame.encode()).await?;
            self.conn_send_window -= len;
            stream_window -= len;
            offset = end;
        }
        Ok(())
    }

    async fn read_response(&mut self, stream_id: u32) -> Result<Response> {
        let mut response_headers: Option<Vec<(String, String)>> = None;
        let mut body = BytesMut::new();
        let mut header_fragments: Option<BytesMut> = None;
        let mut recv_consumed: i64 = 0;

        loop {
            let (header, payload) = self.read_frame().await?;

            match header.frame_type {
                FrameType::Settings => {
                    let settings = SettingsFrame::parse(header.flags, payload);
                    if !settings.ack {
                        self.apply_peer_settings(&settings);
                        self.write_all(&SettingsFrame::ack().encode()).await?;
                        self.stream
                            .flush()
                            .await
                            .map_err(|e| Error::protocol(format!("h2 flush: {e}")))?;
                    }
                }
                FrameType::Ping => {
                    if let Some(ping) = PingFrame::parse(header.flags, &payload) {
                        if !ping.ack {
                            self.write_all(
                                &PingFrame {
                                    payload: ping.payload,
                                    ack: true,
                                }
                                .encode(),
                            )
                            .await?;
                            self.stream
                                .flush()
                                .await
                                .map_err(|e| Error::protocol(format!("h2 flush: {e}")))?;
                        }
                    }
                }
                FrameType::WindowUpdate => {
                    if let Some(update) = WindowUpdateFrame::parse(header.stream_id, payload) {
                        if update.stream_id == 0 {
                            self.conn_send_window += update.increment as i64;
                        }
                    }
                }
                FrameType::Headers if header.stream_id == stream_id => {
                    let block = HeadersFrame::strip_payload(header.flags, payload)
                        .ok_or_else(|| Error::protocol("malformed HEADERS frame"))?;
                    if header.flags & flags::END_HEADERS != 0 {
                        let fields = self
                            .decoder
                            .decode(&block)
                            .map_err(|e| Error::protocol(format!("hpack: {e}")))?;
                        let end_stream = header.flags & flags::END_STREAM != 0;
                        interpret_headers(fields, &mut response_headers)?;
                        if end_stream && response_headers.is_some() {
                            return finalize(response_headers, body);
                        }
                    } else {
                        let mut fragments = BytesMut::from(block.as_ref());
                        fragments.reserve(1024);
                        header_fragments = Some(fragments);
                    }
                }
                FrameType::Continuation if header.stream_id == stream_id => {
                    let fragments = header_fragments
                        .as_mut()
                        .ok_or_else(|| Error::protocol("CONTINUATION without HEADERS"))?;
                    fragments.extend_from_slice(&payload);
                    if header.flags & flags::END_HEADERS != 0 {
                        let block = header_fragments.take().unwrap_or_default();
                        let fields = self
                            .decoder
                            .decode(&block)
                            .map_err(|e| Error::protocol(format!("hpack: {e}")))?;
                        let end_stream = header.flags & flags::END_STREAM != 0;
                        interpret_headers(fields, &mut response_headers)?;
                        if end_stream {
                            return finalize(response_headers, body);
                        }
                    }
                }
                FrameType::Data if header.stream_id == stream_id => {
                    let end_stream = header.flags & flags::END_STREAM != 0;
                    let data = DataFrame::strip_payload(header.flags, payload)
                        .ok_or_else(|| Error::protocol("malformed DATA frame"))?;
                    recv_consumed += data.len() as i64;
                    body.extend_from_slice(&data);

                    if end_stream {
                        return finalize(response_headers, body);
                    }

                    if recv_consumed >= WINDOW_REFILL_THRESHOLD {
                        let increment = recv_consumed as u32;
                        recv_consumed = 0;
                        self.write_all(
                            &WindowUpdateFrame {
                                stream_id: 0,
                                increment,
                            }
                            .encode(),
                        )
                        .await?;
                        self.write_all(
                            &WindowUpdateFrame {
                                stream_id,
                                increment,
                            }
                            .encode(),
                        )
                        .await?;
                        self.stream
                            .flush()
                            .await
                            .map_err(|e| Error::protocol(format!("h2 flush: {e}")))?;
                    }
                }
                FrameType::RstStream if header.stream_id == stream_id => {
                    let code = RstStreamFrame::parse(header.stream_id, payload)
                        .map(|f| f.error_code)
                        .unwrap_or(0);
                    return Err(Error::protocol(format!("stream reset, error code {code}")));
                }
                FrameType::GoAway => {
                    let frame = GoAwayFrame::parse(payload)
                        .ok_or_else(|| Error::protocol("malformed GOAWAY"))?;
                    self.goaway_last_stream = Some(frame.last_stream_id);
                    if frame.last_stream_id < stream_id {
                        self.broken = true;
                        return Err(Error::protocol(format!(
                            "GOAWAY before stream {stream_id}, error code {}",
                            frame.error_code
                        )));
                    }
                }
                _ => {}
            }
        }
    }

    /// Drive the read side for one frame while the send side is blocked on
    /// flow control.
    async fn pump_one_frame(&mut self, stream_id: u32, stream_window: &mut i64) -> Result<()> {
        let (header, payload) = self.read_frame().await?;
        match header.frame_type {
            FrameType::WindowUpdate => {
                if let Some(update) = WindowUpdateFrame::parse(header.stream_id, payload) {
                    if update.stream_id == 0 {
                        self.conn_send_window += update.increment as i64;
                    } else if update.stream_id == stream_id {
                        *stream_window += update.increment as i64;
                    }
                }
            }
            FrameType::Settings => {
                let settings = SettingsFrame::parse(header.flags, payload);
                if !settings.ack {
                    self.apply_peer_settings(&settings);
                    self.write_all(&SettingsFrame::ack().encode()).await?;
                }
            }
            FrameType::GoAway => {
                self.broken = true;
                return Err(Error::protocol("GOAWAY while sending body"));
            }
            FrameType::RstStream if header.stream_id == stream_id => {
                return Err(Error::protocol("stream reset while sending body"));
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_peer_settings(&mut self, settings: &SettingsFrame) {
        for &(id, value) in &settings.entries {
            match id {
                0x1 => self.encoder.set_max_table_size(value as usize),
                0x4 if value <= i32::MAX as u32 => {
                    self.peer_initial_window = value as i64;
                }
                0x5 if (16384..=16_777_215).contains(&value) => {
                    self.peer_max_frame_size = value as usize;
                }
                _ => {}
            }
        }
    }

    async fn read_frame(&mut self) -> Result<(FrameHeader, Bytes)> {
        loop {
            if self.read_buf.len() >= FRAME_HEADER_SIZE {
                if let Some(header) = FrameHeader::parse(&self.read_buf) {
                    let total = FRAME_HEADER_SIZE + header.length as usize;
                    if self.read_buf.len() >= total {
                        self.read_buf.advance(FRAME_HEADER_SIZE);
                        let payload = self.read_buf.split_to(header.length as usize).freeze();
                        return Ok((header, payload));
                    }
                }
            }
            let mut chunk = [0u8; 16384];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::protocol(format!("h2 read: {e}")))?;
            if n == 0 {
                self.broken = true;
                return Err(Error::protocol("connection closed mid-stream"));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream
            .write_all(data)
            .await
            .map_err(|e| Error::protocol(format!("h2 write: {e}")))
    }
}

/// Fold a decoded header block into the response state; informational
/// (1xx) blocks are discarded.
fn interpret_headers(
    fields: Vec<(String, String)>,
    slot: &mut Option<Vec<(String, String)>>,
) -> Result<Option<Response>> {
    let status = fields
        .iter()
        .find(|(n, _)| n == ":status")
        .and_then(|(_, v)| v.parse::<u16>().ok());

    match status {
        Some(code) if (100..200).contains(&code) => Ok(None),
        Some(_) | None if slot.is_some() => {
            // Trailers; fold into the existing header list.
            if let Some(existing) = slot.as_mut() {
                existing.extend(fields.into_iter().filter(|(n, _)| !n.starts_with(':')));
            }
            Ok(None)
        }
        Some(_) => {
            *slot = Some(fields);
            Ok(None)
        }
        None => Err(Error::protocol("response block missing :status")),
    }
}

fn finalize(headers: Option<Vec<(String, String)>>, body: BytesMut) -> Result<Response> {
    let fields = headers.ok_or_else(|| Error::protocol("stream ended without headers"))?;
    let status = fields
        .iter()
        .find(|(n, _)| n == ":status")
        .and_then(|(_, v)| v.parse::<u16>().ok())
        .ok_or_else(|| Error::protocol("response missing :status"))?;
    let regular: Vec<(String, String)> = fields
        .into_iter()
        .filter(|(n, _)| !n.starts_with(':'))
        .collect();
    Ok(Response::new(status, regular, body.freeze(), HttpVersion::Http2))
}
