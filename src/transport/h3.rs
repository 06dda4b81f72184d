//! HTTP/3 over quiche, with the QUIC transport shaped by the fingerprint.
//!
//! One UDP socket per connection, owned here; the engine pumps egress and
//! ingress around the quiche state machine until the response stream
//! finishes.

use bytes::Bytes;
use getrandom::getrandom;
use quiche::h3::NameValue;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{sleep, timeout};

use crate::error::{Error, Result};
use crate::fingerprint::http2::{PseudoHeader, PseudoOrder};
use crate::fingerprint::quic::QuicFingerprint;
use crate::response::Response;
use crate::version::HttpVersion;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_POLL: Duration = Duration::from_millis(100);
const RECV_BUF: usize = 65535;

/// HTTP/3 client bound to one QUIC fingerprint.
#[derive(Debug, Clone)]
pub struct H3Client {
    fingerprint: QuicFingerprint,
    pseudo_order: PseudoOrder,
    verify_peer: bool,
}

impl H3Client {
    pub fn new(fingerprint: QuicFingerprint, pseudo_order: PseudoOrder, verify_peer: bool) -> Self {
        Self {
            fingerprint,
            pseudo_order,
            verify_peer,
        }
    }

    fn configure(&self) -> Result<quiche::Config> {
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)
            .map_err(|e| Error::protocol(format!("quiche config: {e}")))?;

        config.set_application_protos(quiche::h3::APPLICATION_PROTOCOL);
        config.set_max_idle_timeout(self.fingerprint.idle_timeout_ms);
        config.set_max_recv_udp_payload_size(RECV_BUF);
        config.set_max_send_udp_payload_size(self.fingerprint.udp_payload_size);
        config.set_initial_max_data(self.fingerprint.initial_max_data);
        config.set_initial_max_stream_data_bidi_local(self.fingerprint.stream_data_bidi_local);
        config.set_initial_max_stream_data_bidi_remote(self.fingerprint.stream_data_bidi_remote);
        config.set_initial_max_stream_data_uni(self.fingerprint.stream_data_bidi_local);
        config.set_initial_max_streams_bidi(self.fingerprint.initial_max_streams_bidi);
        config.set_initial_max_streams_uni(self.fingerprint.initial_max_streams_uni);
        config.set_disable_active_migration(true);
        config.verify_peer(self.verify_peer);

        Ok(config)
    }

    /// Carry one request over a fresh QUIC connection.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_request(
        &self,
        host: &str,
        port: u16,
        server_name: Option<&str>,
        path: &str,
        method: &str,
        headers: &[(String, String)],
        body: Option<&Bytes>,
    ) -> Result<Response> {
        let peer: SocketAddr = lookup_host((host, port))
            .await
            .map_err(|e| Error::connection(format!("resolve {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| Error::connection(format!("no address for {host}:{port}")))?;

        let socket = UdpSocket::bind(match peer {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        })
        .await
        .map_err(Error::Io)?;

        let mut scid_bytes = vec![0u8; self.fingerprint.connection_id_len];
        getrandom(&mut scid_bytes)
            .map_err(|e| Error::protocol(format!("connection id rng: {e}")))?;
        let scid = quiche::ConnectionId::from_ref(&scid_bytes);

        let mut config = self.configure()?;
        let local = socket.local_addr().map_err(Error::Io)?;
        let sni = server_name.unwrap_or(host);

        let mut conn = quiche::connect(Some(sni), &scid, local, peer, &mut config)
            .map_err(|e| Error::protocol(format!("quic connect: {e}")))?;

        // Handshake pump.
        let start = Instant::now();
        loop {
            if start.elapsed() > HANDSHAKE_TIMEOUT {
                return Err(Error::timeout("QUIC handshake"));
            }
            flush_egress(&mut conn, &socket, peer).await?;
            if conn.is_established() {
                break;
            }
            if conn.is_closed() {
                return Err(Error::protocol("QUIC connection closed during handshake"));
            }
            match timeout(RECV_POLL, recv_ingress(&socket, &mut conn)).await {
                Ok(result) => result?,
                Err(_) => continue,
            }
        }

        let h3_config = quiche::h3::Config::new()
            .map_err(|e| Error::protocol(format!("h3 config: {e}")))?;
        let mut h3_conn = quiche::h3::Connection::with_transport(&mut conn, &h3_config)
            .map_err(|e| Error::protocol(format!("h3 transport: {e}")))?;

        let wire_headers = self.build_headers(method, sni, path, headers);
        let stream_id = h3_conn
            .send_request(&mut conn, &wire_headers, body.is_none())
            .map_err(|e| Error::protocol(format!("h3 send request: {e}")))?;

        if let Some(body) = body {
            h3_conn
                .send_body(&mut conn, stream_id, body, true)
                .map_err(|e| Error::protocol(format!("h3 send body: {e}")))?;
        }

        // Response pump.
        let start = Instant::now();
        let mut status: Option<u16> = None;
        let mut response_headers: Vec<(String, String)> = Vec::new();
        let mut body_out: Vec<u8> = Vec::new();
        let mut finished = false;

        loop {
            if start.elapsed() > RESPONSE_TIMEOUT {
                return Err(Error::timeout("HTTP/3 response"));
            }
            flush_egress(&mut conn, &socket, peer).await?;

            loop {
                match h3_conn.poll(&mut conn) {
                    Ok((id, quiche::h3::Event::Headers { list, .. })) if id == stream_id => {
                        for header in list {
                            let name = String::from_utf8_lossy(header.name()).into_owned();
                            let value = String::from_utf8_lossy(header.value()).into_owned();
                            if name == ":status" {
                                status = value.parse().ok();
                            } else if !name.starts_with(':') {
                                response_headers.push((name, value));
                            }
                        }
                    }
                    Ok((id, quiche::h3::Event::Data)) if id == stream_id => {
                        let mut chunk = vec![0u8; RECV_BUF];
                        loop {
                            match h3_conn.recv_body(&mut conn, stream_id, &mut chunk) {
                                Ok(n) => body_out.extend_from_slice(&chunk[..n]),
                                Err(quiche::h3::Error::Done) => break,
                                Err(e) => {
                                    return Err(Error::protocol(format!("h3 recv body: {e}")))
                                }
                            }
                        }
                    }
                    Ok((id, quiche::h3::Event::Finished)) if id == stream_id => {
                        finished = true;
                    }
                    Ok((id, quiche::h3::Event::Reset(code))) if id == stream_id => {
                        return Err(Error::protocol(format!("h3 stream reset, code {code}")));
                    }
                    Ok((_, quiche::h3::Event::GoAway)) => {
                        return Err(Error::protocol("h3 GOAWAY received"));
                    }
                    Ok(_) => {}
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => return Err(Error::protocol(format!("h3 poll: {e}"))),
                }
            }

            if finished && status.is_some() {
                break;
            }
            if conn.is_closed() {
                return Err(Error::protocol("QUIC connection closed before response"));
            }
            match timeout(RECV_POLL, recv_ingress(&socket, &mut conn)).await {
                Ok(result) => result?,
                Err(_) => continue,
            }
            sleep(Duration::from_millis(1)).await;
        }

        conn.close(true, 0x0, b"done").ok();
        flush_egress(&mut conn, &socket, peer).await.ok();

        Ok(Response::new(
            status.unwrap_or(0),
            response_headers,
            Bytes::from(body_out),
            HttpVersion::Http3,
        ))
    }

    /// Pseudo-headers in fingerprint order, then the executor's headers.
    fn build_headers(
        &self,
        method: &str,
        authority: &str,
        path: &str,
        headers: &[(String, String)],
    ) -> Vec<quiche::h3::Header> {
        let mut out = Vec::with_capacity(4 + headers.len());
        for pseudo in self.pseudo_order.0 {
            let (name, value): (&[u8], &[u8]) = match pseudo {
                PseudoHeader::Method => (b":method", method.as_bytes()),
                PseudoHeader::Scheme => (b":scheme", b"https"),
                PseudoHeader::Authority => (b":authority", authority.as_bytes()),
                PseudoHeader::Path => (b":path", path.as_bytes()),
            };
            out.push(quiche::h3::Header::new(name, value));
        }
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            if lower == "host" || lower.starts_with(':') {
                continue;
            }
            out.push(quiche::h3::Header::new(lower.as_bytes(), value.as_bytes()));
        }
        out
    }
}

async fn flush_egress(
    conn: &mut quiche::Connection,
    socket: &UdpSocket,
    peer: SocketAddr,
) -> Result<()> {
    let mut out = vec![0u8; RECV_BUF];
    loop {
        match conn.send(&mut out) {
            Ok((len, _info)) if len > 0 => {
                socket.send_to(&out[..len], peer).await.map_err(Error::Io)?;
            }
            Ok(_) | Err(quiche::Error::Done) => break,
            Err(e) => return Err(Error::protocol(format!("quic send: {e}"))),
        }
    }
    Ok(())
}

async fn recv_ingress(socket: &UdpSocket, conn: &mut quiche::Connection) -> Result<()> {
    let mut buf = vec![0u8; RECV_BUF];
    let (len, from) = socket.recv_from(&mut buf).await.map_err(Error::Io)?;
    let info = quiche::RecvInfo {
        from,
        to: socket.local_addr().map_err(Error::Io)?,
    };
    match conn.recv(&mut buf[..len], info) {
        Ok(_) | Err(quiche::Error::Done) => Ok(()),
        Err(e) => Err(Error::protocol(format!("quic recv: {e}"))),
    }
}
