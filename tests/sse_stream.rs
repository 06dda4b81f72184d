//! SSE lifecycle against a streaming mock server.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wraith::sse::{SseConnection, SseOptions, SseRegistry};

async fn start_sse_server(body_frames: Vec<&'static str>, chunked: bool) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let frames = body_frames.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;

                let head = if chunked {
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n"
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n"
                };
                socket.write_all(head.as_bytes()).await.unwrap();

                for frame in frames {
                    let payload = if chunked {
                        format!("{:x}\r\n{}\r\n", frame.len(), frame)
                    } else {
                        frame.to_string()
                    };
                    socket.write_all(payload.as_bytes()).await.unwrap();
                    socket.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                if chunked {
                    socket.write_all(b"0\r\n\r\n").await.unwrap();
                }
                // Close ends the stream.
            });
        }
    });
    port
}

#[tokio::test]
async fn events_are_delivered_one_at_a_time() {
    let port = start_sse_server(
        vec![
            "event: greeting\ndata: hello\n\n",
            "data: line one\ndata: line two\n\n",
            "id: 9\nretry: 1500\ndata: tagged\n\n",
        ],
        false,
    )
    .await;

    let mut conn = SseConnection::connect(&SseOptions {
        url: format!("http://127.0.0.1:{port}/events"),
        timeout: Duration::from_secs(5),
        ..SseOptions::default()
    })
    .await
    .unwrap();

    let first = conn.next_event().await.unwrap().unwrap();
    assert_eq!(first.event, "greeting");
    assert_eq!(first.data, "hello");

    let second = conn.next_event().await.unwrap().unwrap();
    assert_eq!(second.event, "message");
    assert_eq!(second.data, "line one\nline two");

    let third = conn.next_event().await.unwrap().unwrap();
    assert_eq!(third.id.as_deref(), Some("9"));
    assert_eq!(third.retry, Some(1500));
    assert_eq!(third.data, "tagged");

    // Server closed: end of stream.
    assert!(conn.next_event().await.unwrap().is_none());
}

#[tokio::test]
async fn chunked_transfer_is_transparent_to_the_parser() {
    let port = start_sse_server(
        vec!["data: chunk", "ed stream\n\n", "data: second\n\n"],
        true,
    )
    .await;

    let mut conn = SseConnection::connect(&SseOptions {
        url: format!("http://127.0.0.1:{port}/stream"),
        timeout: Duration::from_secs(5),
        ..SseOptions::default()
    })
    .await
    .unwrap();

    let first = conn.next_event().await.unwrap().unwrap();
    assert_eq!(first.data, "chunked stream");
    let second = conn.next_event().await.unwrap().unwrap();
    assert_eq!(second.data, "second");
    assert!(conn.next_event().await.unwrap().is_none());
}

#[tokio::test]
async fn non_200_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else { return };
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let err = SseConnection::connect(&SseOptions {
        url: format!("http://127.0.0.1:{port}/missing"),
        timeout: Duration::from_secs(5),
        ..SseOptions::default()
    })
    .await
    .unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn registry_tracks_handles() {
    let port = start_sse_server(vec!["data: via registry\n\n"], false).await;
    let registry = SseRegistry::new();

    let handle = registry
        .connect(&SseOptions {
            url: format!("http://127.0.0.1:{port}/r"),
            timeout: Duration::from_secs(5),
            ..SseOptions::default()
        })
        .await;
    assert_ne!(handle, 0);
    assert_eq!(registry.len(), 1);

    let event = registry.next_event(handle).await.unwrap().unwrap();
    assert_eq!(event.data, "via registry");

    registry.close(handle).await;
    assert!(registry.is_empty());
    assert!(registry.next_event(handle).await.is_err());
}

#[tokio::test]
async fn connect_to_dead_port_returns_zero_handle() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let registry = SseRegistry::new();
    let handle = registry
        .connect(&SseOptions {
            url: format!("http://127.0.0.1:{port}/"),
            timeout: Duration::from_secs(2),
            ..SseOptions::default()
        })
        .await;
    assert_eq!(handle, 0);
}
