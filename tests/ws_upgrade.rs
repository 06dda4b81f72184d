//! WebSocket upgrade and message loop against a local RFC 6455 server.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use fastwebsockets::{Frame, OpCode, Payload, Role, WebSocket};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wraith::ws::{WsConnection, WsOpcode, WsOptions, WsRegistry};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Accept one connection, perform the server side of the upgrade, then
/// echo every TEXT/BINARY frame until CLOSE.
async fn start_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                // Read the upgrade request head.
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if socket.read(&mut byte).await.unwrap_or(0) == 0 {
                        return;
                    }
                    head.push(byte[0]);
                }
                let head_text = String::from_utf8_lossy(&head).into_owned();
                let key = head_text
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.trim()
                            .eq_ignore_ascii_case("sec-websocket-key")
                            .then(|| value.trim().to_string())
                    })
                    .unwrap();
                let accept = BASE64.encode(Sha1::digest(format!("{key}{WS_GUID}").as_bytes()));

                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
                );
                socket.write_all(response.as_bytes()).await.unwrap();

                let mut server_ws = WebSocket::after_handshake(socket, Role::Server);
                server_ws.set_auto_close(false);
                server_ws.set_auto_pong(true);
                loop {
                    let Ok(frame) = server_ws.read_frame().await else { return };
                    match frame.opcode {
                        OpCode::Text => {
                            let echo = Frame::text(Payload::Owned(frame.payload.to_vec()));
                            if server_ws.write_frame(echo).await.is_err() {
                                return;
                            }
                        }
                        OpCode::Binary => {
                            let echo = Frame::binary(Payload::Owned(frame.payload.to_vec()));
                            if server_ws.write_frame(echo).await.is_err() {
                                return;
                            }
                        }
                        OpCode::Close => {
                            let _ = server_ws
                                .write_frame(Frame::close(1000, b""))
                                .await;
                            return;
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn text_and_binary_round_trip() {
    let port = start_echo_server().await;
    let mut conn = WsConnection::connect(&WsOptions {
        url: format!("ws://127.0.0.1:{port}/socket"),
        ..WsOptions::default()
    })
    .await
    .unwrap();

    conn.send(WsOpcode::Text, Bytes::from_static(b"hello ws"))
        .await
        .unwrap();
    let (opcode, payload) = conn.receive().await.unwrap();
    assert_eq!(opcode, WsOpcode::Text);
    assert_eq!(payload.as_ref(), b"hello ws");

    conn.send(WsOpcode::Binary, Bytes::from_static(&[0, 159, 146, 150]))
        .await
        .unwrap();
    let (opcode, payload) = conn.receive().await.unwrap();
    assert_eq!(opcode, WsOpcode::Binary);
    assert_eq!(payload.as_ref(), &[0, 159, 146, 150]);

    conn.close().await;
}

#[tokio::test]
async fn custom_headers_ride_the_upgrade_request() {
    // Capture the upgrade head instead of echoing.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (head_tx, head_rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else { return };
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).await.unwrap_or(0) == 0 {
                return;
            }
            head.push(byte[0]);
        }
        let _ = head_tx.send(String::from_utf8_lossy(&head).into_owned());
        // Refuse the upgrade; the client errors out, which is fine here.
        let _ = socket
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let result = WsConnection::connect(&WsOptions {
        url: format!("ws://127.0.0.1:{port}/socket"),
        headers: vec![("X-Api-Key".to_string(), "secret123".to_string())],
        user_agent: Some("wraith-test/1.0".to_string()),
        ..WsOptions::default()
    })
    .await;
    assert!(result.is_err());

    let head = head_rx.await.unwrap();
    assert!(head.contains("Upgrade: websocket"));
    assert!(head.contains("Sec-WebSocket-Version: 13"));
    assert!(head.contains("X-Api-Key: secret123"));
    assert!(head.contains("User-Agent: wraith-test/1.0"));
}

#[tokio::test]
async fn registry_handles_connect_send_receive_close() {
    let port = start_echo_server().await;
    let registry = WsRegistry::new();

    let handle = registry
        .connect(&WsOptions {
            url: format!("ws://127.0.0.1:{port}/socket"),
            ..WsOptions::default()
        })
        .await;
    assert_ne!(handle, 0);
    assert_eq!(registry.len(), 1);

    registry
        .send(handle, WsOpcode::Text, Bytes::from_static(b"ping"))
        .await
        .unwrap();
    let (opcode, payload) = registry.receive(handle).await.unwrap();
    assert_eq!(opcode, WsOpcode::Text);
    assert_eq!(payload.as_ref(), b"ping");

    registry.close(handle).await;
    assert!(registry.is_empty());
    assert!(registry
        .send(handle, WsOpcode::Text, Bytes::new())
        .await
        .is_err());
}

#[tokio::test]
async fn bad_accept_key_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else { return };
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).await.unwrap_or(0) == 0 {
                return;
            }
            head.push(byte[0]);
        }
        let _ = socket
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bogus\r\n\r\n",
            )
            .await;
    });

    let err = WsConnection::connect(&WsOptions {
        url: format!("ws://127.0.0.1:{port}/socket"),
        ..WsOptions::default()
    })
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Accept"));
}
