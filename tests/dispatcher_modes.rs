//! The four dispatch modes over the boundary codec: sync, async by
//! polling handle, async by pipe notification, and batch fan-out.

mod helpers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use helpers::{ok_response, MockServer};
use serde::Serialize;
use wraith::boundary::ResponsePayload;
use wraith::dispatch::Dispatcher;
use wraith::Engine;

#[derive(Serialize, Default)]
struct TestOptions {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    timeout: u64,
}

#[derive(Serialize)]
struct TestEnvelope {
    #[serde(rename = "requestId")]
    request_id: String,
    options: TestOptions,
}

#[derive(Serialize)]
struct TestBatch {
    requests: Vec<TestEnvelope>,
}

fn envelope(request_id: &str, url: &str) -> TestEnvelope {
    TestEnvelope {
        request_id: request_id.to_string(),
        options: TestOptions {
            url: url.to_string(),
            method: "GET".to_string(),
            timeout: 10,
            ..TestOptions::default()
        },
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut out).with_struct_map();
    value.serialize(&mut serializer).unwrap();
    out
}

fn decode(payload: &[u8]) -> ResponsePayload {
    rmp_serde::from_slice(payload).unwrap()
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Arc::new(Engine::new()))
}

#[tokio::test]
async fn sync_mode_preserves_request_id() {
    let server = MockServer::start_with(|_| ok_response("sync body")).await;
    let dispatcher = dispatcher();

    let payload = encode(&envelope("sync-1", &server.url("/")));
    let response = decode(&dispatcher.sync_request(&payload).await);
    assert_eq!(response.request_id, "sync-1");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "sync body");
}

#[tokio::test]
async fn per_request_errors_become_status_zero_payloads() {
    let dispatcher = dispatcher();

    // Unroutable URL: the dispatcher encodes the failure, never errors.
    let payload = encode(&envelope("err-1", "http://127.0.0.1:1/"));
    let response = decode(&dispatcher.sync_request(&payload).await);
    assert_eq!(response.request_id, "err-1");
    assert_eq!(response.status, 0);
    assert!(!response.body.is_empty());
}

#[tokio::test]
async fn malformed_payload_is_an_error_payload_not_a_crash() {
    let dispatcher = dispatcher();
    let response = decode(&dispatcher.sync_request(b"not msgpack").await);
    assert_eq!(response.status, 0);
}

#[tokio::test]
async fn async_submit_poll_take_lifecycle() {
    let server = MockServer::start_with(|_| ok_response("async body")).await;
    let dispatcher = dispatcher();

    let payload = encode(&envelope("async-1", &server.url("/")));
    let handle = dispatcher.submit_async(&payload);
    assert_ne!(handle, 0);

    // Poll until ready.
    let response = loop {
        if let Some(result) = dispatcher.poll_async(handle) {
            break decode(&result);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(response.request_id, "async-1");
    assert_eq!(response.status, 200);

    // The handle was consumed.
    assert_eq!(dispatcher.poll_async(handle), None);
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn submit_async_rejects_garbage_with_zero_handle() {
    let dispatcher = dispatcher();
    assert_eq!(dispatcher.submit_async(b"garbage"), 0);
}

#[tokio::test]
async fn cancelled_handle_yields_cancelled_payload() {
    // A server that never responds keeps the task suspended.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(socket);
            });
        }
    });

    let dispatcher = dispatcher();
    let payload = encode(&envelope("cancel-1", &format!("http://127.0.0.1:{port}/")));
    let handle = dispatcher.submit_async(&payload);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dispatcher.cancel(handle));

    let response = loop {
        if let Some(result) = dispatcher.poll_async(handle) {
            break decode(&result);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(response.status, 0);
    assert!(response.body.contains("cancelled"));
}

#[cfg(unix)]
#[tokio::test]
async fn notify_mode_writes_exactly_one_byte() {
    use std::os::fd::AsRawFd;

    let server = MockServer::start_with(|_| ok_response("notified")).await;
    let dispatcher = dispatcher();

    let (read_end, write_end) = std::os::unix::net::UnixStream::pair().unwrap();
    read_end.set_nonblocking(false).unwrap();

    let payload = encode(&envelope("notify-1", &server.url("/")));
    let handle = dispatcher.submit_with_notify(&payload, write_end.as_raw_fd());
    assert_ne!(handle, 0);

    // Block on the pipe from a blocking thread: exactly one byte arrives.
    let reader = tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut read_end = read_end;
        let mut buf = [0u8; 8];
        let n = read_end.read(&mut buf).unwrap();
        (n, buf[0])
    });
    let (n, byte) = reader.await.unwrap();
    assert_eq!((n, byte), (1, 1));

    let response = decode(&dispatcher.take_async_result(handle).unwrap());
    assert_eq!(response.request_id, "notify-1");
    assert_eq!(response.status, 200);

    // Second take returns nothing.
    assert_eq!(dispatcher.take_async_result(handle), None);
}

#[tokio::test]
async fn batch_fans_out_and_preserves_declaration_order() {
    let server = MockServer::start_with(|head| {
        let path = head
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();
        ok_response(&format!("body for {path}"))
    })
    .await;
    let dispatcher = dispatcher();

    let batch = TestBatch {
        requests: (0..10)
            .map(|i| envelope(&format!("req-{i}"), &server.url(&format!("/{i}"))))
            .collect(),
    };
    let encoded = dispatcher.batch_request(&encode(&batch)).await;

    #[derive(serde::Deserialize)]
    struct BatchOut {
        responses: Vec<ResponsePayload>,
    }
    let out: BatchOut = rmp_serde::from_slice(&encoded).unwrap();
    assert_eq!(out.responses.len(), 10);
    for (i, response) in out.responses.iter().enumerate() {
        assert_eq!(response.request_id, format!("req-{i}"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, format!("body for /{i}"));
    }
}

#[tokio::test]
async fn batch_elements_fail_independently() {
    let server = MockServer::start_with(|_| ok_response("fine")).await;
    let dispatcher = dispatcher();

    let batch = TestBatch {
        requests: vec![
            envelope("good", &server.url("/")),
            envelope("bad", "http://127.0.0.1:1/"),
            // Empty RequestID defaults to batch_<index>.
            envelope("", &server.url("/")),
        ],
    };
    let encoded = dispatcher.batch_request(&encode(&batch)).await;

    #[derive(serde::Deserialize)]
    struct BatchOut {
        responses: Vec<ResponsePayload>,
    }
    let out: BatchOut = rmp_serde::from_slice(&encoded).unwrap();
    assert_eq!(out.responses.len(), 3);
    assert_eq!(out.responses[0].status, 200);
    assert_eq!(out.responses[1].status, 0);
    assert_eq!(out.responses[1].request_id, "bad");
    assert_eq!(out.responses[2].request_id, "batch_2");
    assert_eq!(out.responses[2].status, 200);
}

#[tokio::test]
async fn batch_completion_is_concurrent_not_serial() {
    // Each request takes ~150 ms; 8 in parallel must finish well under
    // the serial total.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(Duration::from_millis(150)).await;
                let _ = socket.write_all(ok_response("slow").as_bytes()).await;
            });
        }
    });

    let dispatcher = dispatcher();
    let batch = TestBatch {
        requests: (0..8)
            .map(|i| {
                let mut env = envelope(&format!("slow-{i}"), &format!("http://127.0.0.1:{port}/"));
                // Fresh connections so the mock serves them in parallel.
                env.options.headers.insert("x-lane".to_string(), i.to_string());
                env
            })
            .collect(),
    };

    let started = std::time::Instant::now();
    let encoded = dispatcher.batch_request(&encode(&batch)).await;
    let elapsed = started.elapsed();

    #[derive(serde::Deserialize)]
    struct BatchOut {
        responses: Vec<ResponsePayload>,
    }
    let out: BatchOut = rmp_serde::from_slice(&encoded).unwrap();
    assert!(out.responses.iter().all(|r| r.status == 200));
    assert!(
        elapsed < Duration::from_millis(8 * 150),
        "batch took {elapsed:?}, looks serial"
    );
}
