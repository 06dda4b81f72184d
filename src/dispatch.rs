//! Request dispatcher: the four execution modes over one engine.
//!
//! Every inbound request runs on its own tokio task; per-request failures
//! are encoded as status-0 payloads and a panicking task is converted to a
//! protocol-error payload at this boundary, never propagated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::{AbortHandle, JoinHandle};

use crate::boundary::{
    decode_batch, decode_request, encode_payload, BatchResponsePayload, RequestEnvelope,
    ResponsePayload,
};
use crate::error::Error;
use crate::executor::Engine;

/// Opaque async handle, safely convertible to/from the host runtime.
pub type Handle = u64;

struct Slot {
    result: Option<Vec<u8>>,
    abort: AbortHandle,
}

/// Dispatcher over an engine. Clones share the handle table and pool.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<Engine>,
    slots: Arc<DashMap<Handle, Slot>>,
    next_handle: Arc<AtomicU64>,
}

/// Process-wide default dispatcher for the host boundary. Library users
/// construct their own [`Engine`] and [`Dispatcher`] instead.
pub fn global() -> &'static Dispatcher {
    static GLOBAL: std::sync::OnceLock<Dispatcher> = std::sync::OnceLock::new();
    GLOBAL.get_or_init(|| Dispatcher::new(Arc::new(Engine::new())))
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            slots: Arc::new(DashMap::new()),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Synchronous mode: block the caller until the response payload is
    /// ready. Still spawns so concurrent sync callers multiplex.
    pub async fn sync_request(&self, payload: &[u8]) -> Vec<u8> {
        let envelope = match decode_request(payload) {
            Ok(envelope) => envelope,
            Err(e) => return error_payload("", &e),
        };
        let engine = self.engine.clone();
        let request_id = effective_id(&envelope, None);
        match tokio::spawn(run_one(engine, envelope, None)).await {
            Ok(payload) => payload,
            Err(join_err) => join_error_payload(&request_id, join_err),
        }
    }

    /// Async-by-handle mode: `submit` returns an opaque handle; `poll`
    /// returns the payload once ready. Returns 0 on a malformed payload.
    pub fn submit_async(&self, payload: &[u8]) -> Handle {
        let Ok(envelope) = decode_request(payload) else {
            return 0;
        };
        self.submit(envelope, None, None)
    }

    /// Async-by-notification: one byte is written to `notify_fd` when the
    /// result is ready for collection.
    #[cfg(unix)]
    pub fn submit_with_notify(&self, payload: &[u8], notify_fd: std::os::fd::RawFd) -> Handle {
        let Ok(envelope) = decode_request(payload) else {
            return 0;
        };
        self.submit(envelope, Some(notify_fd), None)
    }

    fn submit(
        &self,
        envelope: RequestEnvelope,
        notify_fd: Option<i32>,
        batch_index: Option<usize>,
    ) -> Handle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let request_id = effective_id(&envelope, batch_index);

        let inner = tokio::spawn(run_one(self.engine.clone(), envelope, batch_index));

        // The slot must exist before the collector can race to fill it.
        self.slots.insert(
            handle,
            Slot {
                result: None,
                abort: inner.abort_handle(),
            },
        );

        let slots = self.slots.clone();
        tokio::spawn(async move {
            let payload = match inner.await {
                Ok(payload) => payload,
                Err(join_err) => join_error_payload(&request_id, join_err),
            };
            if let Some(mut slot) = slots.get_mut(&handle) {
                slot.result = Some(payload);
            }
            #[cfg(unix)]
            if let Some(fd) = notify_fd {
                notify_pipe(fd);
            }
            #[cfg(not(unix))]
            let _ = notify_fd;
        });

        handle
    }

    /// Non-blocking poll; consumes the handle when the result is ready.
    pub fn poll_async(&self, handle: Handle) -> Option<Vec<u8>> {
        let ready = self
            .slots
            .get(&handle)
            .is_some_and(|slot| slot.result.is_some());
        if !ready {
            return None;
        }
        self.slots
            .remove(&handle)
            .and_then(|(_, slot)| slot.result)
    }

    /// Collect a notified result; the handle is freed. A second call with
    /// the same handle returns None.
    pub fn take_async_result(&self, handle: Handle) -> Option<Vec<u8>> {
        self.poll_async(handle)
    }

    /// Mark a handle cancelled; the running task observes the signal at
    /// its next suspension point and the slot yields a Cancelled payload.
    pub fn cancel(&self, handle: Handle) -> bool {
        match self.slots.get(&handle) {
            Some(slot) => {
                slot.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Drop a handle without collecting its result.
    pub fn free(&self, handle: Handle) {
        if let Some((_, slot)) = self.slots.remove(&handle) {
            slot.abort.abort();
        }
    }

    /// Batch mode: fan out every request, gather responses in declaration
    /// order. A batch never fails as a whole.
    pub async fn batch_request(&self, payload: &[u8]) -> Vec<u8> {
        let batch = match decode_batch(payload) {
            Ok(batch) => batch,
            Err(e) => {
                return encode_payload(&BatchResponsePayload {
                    responses: vec![ResponsePayload::from_error("", &e)],
                })
                .unwrap_or_default()
            }
        };

        let mut tasks: Vec<(String, JoinHandle<Vec<u8>>)> = Vec::with_capacity(batch.requests.len());
        for (index, envelope) in batch.requests.into_iter().enumerate() {
            let request_id = effective_id(&envelope, Some(index));
            let task = tokio::spawn(run_one(self.engine.clone(), envelope, Some(index)));
            tasks.push((request_id, task));
        }

        let mut responses = Vec::with_capacity(tasks.len());
        for (request_id, task) in tasks {
            let encoded = match task.await {
                Ok(payload) => payload,
                Err(join_err) => join_error_payload(&request_id, join_err),
            };
            let decoded: ResponsePayload = rmp_serde::from_slice(&encoded)
                .unwrap_or_else(|_| {
                    ResponsePayload::from_error(&request_id, &Error::protocol("payload decode"))
                });
            responses.push(decoded);
        }

        encode_payload(&BatchResponsePayload { responses }).unwrap_or_default()
    }

    /// Number of outstanding async handles.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

/// Execute one envelope to an encoded response payload. Never errors: all
/// failures become status-0 payloads.
async fn run_one(engine: Arc<Engine>, envelope: RequestEnvelope, batch_index: Option<usize>) -> Vec<u8> {
    let request_id = effective_id(&envelope, batch_index);
    let mut request = envelope.into_request();
    request.request_id = request_id.clone();

    let payload = match engine.execute(&request).await {
        Ok(response) => ResponsePayload::from_response(&request_id, &response),
        Err(e) => {
            tracing::debug!(request_id = %request_id, "request failed: {e}");
            ResponsePayload::from_error(&request_id, &e)
        }
    };
    encode_payload(&payload).unwrap_or_else(|_| fallback_payload(&request_id))
}

fn effective_id(envelope: &RequestEnvelope, batch_index: Option<usize>) -> String {
    if !envelope.request_id.is_empty() {
        envelope.request_id.clone()
    } else if let Some(index) = batch_index {
        format!("batch_{index}")
    } else {
        "request".to_string()
    }
}

fn error_payload(request_id: &str, error: &Error) -> Vec<u8> {
    encode_payload(&ResponsePayload::from_error(request_id, error))
        .unwrap_or_else(|_| fallback_payload(request_id))
}

fn join_error_payload(request_id: &str, join_err: tokio::task::JoinError) -> Vec<u8> {
    let error = if join_err.is_cancelled() {
        Error::Cancelled
    } else {
        Error::protocol("request task panicked")
    };
    error_payload(request_id, &error)
}

fn fallback_payload(request_id: &str) -> Vec<u8> {
    encode_payload(&ResponsePayload {
        request_id: request_id.to_string(),
        status: 0,
        body: "failed to encode response".to_string(),
        body_bytes: None,
        headers: Vec::new(),
        final_url: String::new(),
        cookies: Vec::new(),
    })
    .unwrap_or_default()
}

/// Signal completion to the host by writing one byte to its pipe.
#[cfg(unix)]
fn notify_pipe(fd: std::os::fd::RawFd) {
    use std::io::Write;
    use std::mem::ManuallyDrop;
    use std::os::fd::FromRawFd;

    // The fd belongs to the host; ManuallyDrop keeps it open after the write.
    let mut file = ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    if let Err(e) = file.write_all(&[1]) {
        tracing::warn!("notify pipe write failed: {e}");
    }
}
