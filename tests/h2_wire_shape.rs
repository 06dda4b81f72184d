//! Wire-shape assertions for the HTTP/2 preface: the SETTINGS frame must
//! contain exactly the fingerprint's entries in order, the WINDOW_UPDATE
//! must follow with the declared increment, and the header block must
//! open with the fingerprint's pseudo-header permutation.

use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use wraith::fingerprint::Http2Fingerprint;
use wraith::transport::h2::hpack::Decoder;
use wraith::transport::h2::H2Connection;

/// Collect frames (type, flags, stream_id, payload) from raw bytes.
fn parse_frames(mut wire: &[u8]) -> Vec<(u8, u8, u32, Vec<u8>)> {
    let mut frames = Vec::new();
    while wire.len() >= 9 {
        let length =
            ((wire[0] as usize) << 16) | ((wire[1] as usize) << 8) | wire[2] as usize;
        let frame_type = wire[3];
        let flags = wire[4];
        let stream_id = u32::from_be_bytes([wire[5] & 0x7f, wire[6], wire[7], wire[8]]);
        if wire.len() < 9 + length {
            break;
        }
        frames.push((frame_type, flags, stream_id, wire[9..9 + length].to_vec()));
        wire = &wire[9 + length..];
    }
    frames
}

async fn read_handshake(server: &mut DuplexStream, at_least: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 16384];
    while collected.len() < at_least {
        let n = server.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream closed early");
        collected.extend_from_slice(&chunk[..n]);
    }
    collected
}

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[tokio::test]
async fn settings_frame_matches_fingerprint_exactly() {
    let fingerprint =
        Http2Fingerprint::parse("1:65536;2:0;4:131072;5:16384|12517377|0|m,p,a,s").unwrap();
    let (client, mut server) = duplex(65536);

    let conn_task = tokio::spawn(H2Connection::connect(client, fingerprint));

    // Preface + SETTINGS(4 entries) + WINDOW_UPDATE.
    let wire = read_handshake(&mut server, PREFACE.len() + 9 + 24 + 9 + 4).await;
    assert_eq!(&wire[..PREFACE.len()], PREFACE);

    let frames = parse_frames(&wire[PREFACE.len()..]);
    let (frame_type, _, stream_id, payload) = &frames[0];
    assert_eq!(*frame_type, 0x4, "first frame must be SETTINGS");
    assert_eq!(*stream_id, 0);
    // Exactly four entries, in fingerprint order, nothing defaulted in.
    assert_eq!(payload.len(), 24);
    let entries: Vec<(u16, u32)> = payload
        .chunks(6)
        .map(|entry| {
            (
                u16::from_be_bytes([entry[0], entry[1]]),
                u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]),
            )
        })
        .collect();
    assert_eq!(entries, vec![(1, 65536), (2, 0), (4, 131072), (5, 16384)]);

    let (frame_type, _, stream_id, payload) = &frames[1];
    assert_eq!(*frame_type, 0x8, "WINDOW_UPDATE follows SETTINGS");
    assert_eq!(*stream_id, 0);
    assert_eq!(
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        12517377
    );

    conn_task.abort();
}

#[tokio::test]
async fn zero_window_update_is_not_sent() {
    let fingerprint = Http2Fingerprint::parse("3:100|0|0|m,s,a,p").unwrap();
    let (client, mut server) = duplex(65536);
    let conn_task = tokio::spawn(H2Connection::connect(client, fingerprint));

    let wire = read_handshake(&mut server, PREFACE.len() + 9 + 6).await;
    let frames = parse_frames(&wire[PREFACE.len()..]);
    assert_eq!(frames[0].0, 0x4);
    assert_eq!(frames[0].3.len(), 6, "single fingerprint entry only");
    assert!(
        frames.iter().all(|(t, ..)| *t != 0x8),
        "no WINDOW_UPDATE for a zero increment"
    );

    conn_task.abort();
}

#[tokio::test]
async fn priority_list_emits_priority_frames() {
    let fingerprint = Http2Fingerprint::parse(
        "1:65536|12517377|3:0:0:201,5:0:0:101,7:0:0:1|m,p,a,s",
    )
    .unwrap();
    let (client, mut server) = duplex(65536);
    let conn_task = tokio::spawn(H2Connection::connect(client, fingerprint));

    let wire =
        read_handshake(&mut server, PREFACE.len() + 9 + 6 + 9 + 4 + 3 * (9 + 5)).await;
    let frames = parse_frames(&wire[PREFACE.len()..]);

    let priorities: Vec<&(u8, u8, u32, Vec<u8>)> =
        frames.iter().filter(|(t, ..)| *t == 0x2).collect();
    assert_eq!(priorities.len(), 3);
    assert_eq!(priorities[0].2, 3);
    assert_eq!(priorities[0].3[4], 200, "wire weight is declared weight minus one");
    assert_eq!(priorities[1].2, 5);
    assert_eq!(priorities[2].2, 7);

    conn_task.abort();
}

#[tokio::test]
async fn request_header_block_opens_with_pseudo_order() {
    let fingerprint = Http2Fingerprint::parse("1:65536|0|0|m,p,a,s").unwrap();
    let (client, mut server) = duplex(65536);

    let mut conn = H2Connection::connect(client, fingerprint).await.unwrap();

    let send_task = tokio::spawn(async move {
        let headers = vec![
            ("user-agent".to_string(), "wraith-test".to_string()),
            ("accept".to_string(), "*/*".to_string()),
        ];
        let _ = conn
            .send_request("GET", "https", "example.com", "/x", &headers, None)
            .await;
    });

    // Skip preface + SETTINGS, then find the HEADERS frame.
    let mut wire = Vec::new();
    let mut chunk = [0u8; 16384];
    let headers_payload = loop {
        let n = server.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        wire.extend_from_slice(&chunk[..n]);
        if wire.len() > PREFACE.len() {
            let frames = parse_frames(&wire[PREFACE.len()..]);
            if let Some((_, _, stream_id, payload)) =
                frames.iter().find(|(t, ..)| *t == 0x1)
            {
                assert_eq!(*stream_id, 1, "first request stream id");
                break payload.clone();
            }
        }
    };

    let fields = Decoder::new().decode(&headers_payload).unwrap();
    let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        &names[..4],
        &[":method", ":path", ":authority", ":scheme"],
        "pseudo-header order must follow the fingerprint"
    );
    assert_eq!(fields[0].1, "GET");
    assert_eq!(fields[1].1, "/x");
    assert_eq!(fields[2].1, "example.com");
    assert_eq!(names[4], "user-agent");
    assert_eq!(names[5], "accept");

    send_task.abort();
}

#[tokio::test]
async fn response_round_trip_over_mock_server() {
    let fingerprint = Http2Fingerprint::parse("1:65536;4:131072|0|0|m,s,a,p").unwrap();
    let (client, mut server) = duplex(65536);

    let server_task = tokio::spawn(async move {
        // Consume the client preface + SETTINGS.
        let mut wire = Vec::new();
        let mut chunk = [0u8; 16384];
        loop {
            let n = server.read(&mut chunk).await.unwrap();
            wire.extend_from_slice(&chunk[..n]);
            if wire.len() > PREFACE.len() {
                let frames = parse_frames(&wire[PREFACE.len()..]);
                if frames.iter().any(|(t, ..)| *t == 0x1) {
                    break;
                }
            }
        }

        // Server preface: empty SETTINGS.
        server
            .write_all(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        // HEADERS: :status 200 (static index 8), END_HEADERS.
        let block: &[u8] = &[0x88];
        let mut headers_frame = vec![0, 0, block.len() as u8, 0x1, 0x4, 0, 0, 0, 1];
        headers_frame.extend_from_slice(block);
        server.write_all(&headers_frame).await.unwrap();

        // DATA "hi", END_STREAM.
        let mut data_frame = vec![0, 0, 2, 0x0, 0x1, 0, 0, 0, 1];
        data_frame.extend_from_slice(b"hi");
        server.write_all(&data_frame).await.unwrap();

        // Hold the stream open (absorbing the client's SETTINGS ACK)
        // until the test tears the runtime down.
        let mut sink = [0u8; 1024];
        while let Ok(n) = server.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    });

    let mut conn = H2Connection::connect(client, fingerprint).await.unwrap();
    let response = conn
        .send_request("GET", "https", "example.com", "/", &[], None)
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body(), &Bytes::from_static(b"hi"));
    assert!(conn.reusable());
    server_task.abort();
}
