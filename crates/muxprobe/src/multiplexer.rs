//! Stream identifier assignment, request construction and the writer task.
//!
//! Identifiers are client-initiated HTTP/2 stream ids: odd, starting at 3,
//! advancing by 2 per assignment. The engine is configured with the same
//! starting id, and the writer checks every stream it opens against the id
//! the allocator handed out.

use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use http::header::{ACCEPT_ENCODING, AUTHORIZATION};
use http::uri::Scheme;
use http::{HeaderMap, HeaderValue, Method, Request, Uri};
use tokio::sync::{mpsc, oneshot};

use crate::config::{HarnessConfig, RequestKind};
use crate::correlator::{self, Correlator};
use crate::error::{StreamFailure, WriteError};

/// A client-initiated stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

impl StreamId {
    /// First identifier handed out. Stream 1 is left to upgrade exchanges.
    pub const FIRST: StreamId = StreamId(3);

    /// Largest identifier HTTP/2 allows.
    pub const MAX: u32 = (1 << 31) - 1;

    /// Returns `None` for even ids and ids beyond [`StreamId::MAX`].
    pub fn new(raw: u32) -> Option<Self> {
        (raw % 2 == 1 && raw <= Self::MAX).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Hands out identifiers in submission order.
///
/// The counter advances on every call, including calls that return `None`
/// once the space is exhausted.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: AtomicU32,
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(StreamId::FIRST)
    }

    pub fn starting_at(first: StreamId) -> Self {
        Self {
            next: AtomicU32::new(first.get()),
        }
    }

    pub fn next(&self) -> Option<StreamId> {
        let raw = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(2))
            .ok()?;
        StreamId::new(raw)
    }

    /// The identifier the next call would return, for diagnostics.
    pub fn peek(&self) -> Option<StreamId> {
        StreamId::new(self.next.load(Ordering::Relaxed))
    }
}

/// Everything needed to put one request on the wire.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub scheme: Scheme,
    pub authority: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    /// Build the descriptor for `kind` on `path` with the headers `config` asks for.
    pub fn new(config: &HarnessConfig, kind: &RequestKind, path: &str) -> Result<Self, http::Error> {
        let mut headers = HeaderMap::new();
        for encoding in &config.accept_encodings {
            headers.append(ACCEPT_ENCODING, HeaderValue::from_str(encoding)?);
        }
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(Self {
            method: kind.method(),
            scheme: config.scheme(),
            authority: config.authority(),
            path: path.to_owned(),
            headers,
            body: kind.body().cloned(),
        })
    }

    pub fn uri(&self) -> Result<Uri, http::Error> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.as_str())
            .path_and_query(self.path.as_str())
            .build()
    }

    /// Request head handed to the engine; the body travels separately.
    pub fn to_request(&self) -> Result<Request<()>, http::Error> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.uri()?)
            .body(())?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// Resolves once the writer task has handed the request to the engine.
#[derive(Debug)]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<(), WriteError>>,
}

impl WriteHandle {
    pub(crate) fn channel() -> (oneshot::Sender<Result<(), WriteError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub async fn wait(self) -> Result<(), WriteError> {
        self.rx.await.unwrap_or(Err(WriteError::Closed))
    }
}

/// A queued request: its identifier, what was sent, and how the write went.
#[derive(Debug)]
pub struct PendingRequest {
    id: StreamId,
    descriptor: RequestDescriptor,
    written: Option<WriteHandle>,
}

impl PendingRequest {
    pub(crate) fn new(id: StreamId, descriptor: RequestDescriptor, written: WriteHandle) -> Self {
        Self {
            id,
            descriptor,
            written: Some(written),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Takes the write-completion handle. Returns `None` once taken.
    pub fn take_write_handle(&mut self) -> Option<WriteHandle> {
        self.written.take()
    }
}

/// One request as handed to the writer task.
pub(crate) struct Outbound {
    pub id: StreamId,
    pub request: Request<()>,
    pub body: Option<Bytes>,
    pub written: oneshot::Sender<Result<(), WriteError>>,
}

/// Write each batch in submission order, then hand the response future of
/// every opened stream to its own receive task.
pub(crate) async fn write_batches(
    mut send: SendRequest<Bytes>,
    mut batches: mpsc::UnboundedReceiver<Vec<Outbound>>,
    correlator: Arc<Correlator>,
    addr: String,
) {
    while let Some(batch) = batches.recv().await {
        tracing::debug!(%addr, batch_len = batch.len(), "writing batch");
        for outbound in batch {
            let Outbound {
                id,
                request,
                body,
                written,
            } = outbound;
            match write_one(&mut send, id, request, body).await {
                Ok(response) => {
                    tracing::trace!(stream_id = %id, "request written");
                    let _ = written.send(Ok(()));
                    tokio::spawn(correlator::receive(id, response, correlator.clone()));
                }
                Err(e) => {
                    tracing::warn!(%addr, stream_id = %id, error = %e, "request write failed");
                    let failure = StreamFailure::Write(e.to_string());
                    let _ = written.send(Err(e));
                    let _ = correlator.deliver(id, Err(failure));
                }
            }
        }
    }
    tracing::debug!(%addr, "writer stopped");
}

async fn write_one(
    send: &mut SendRequest<Bytes>,
    id: StreamId,
    request: Request<()>,
    body: Option<Bytes>,
) -> Result<ResponseFuture, WriteError> {
    poll_fn(|cx| send.poll_ready(cx)).await?;

    let (response, mut stream) = send.send_request(request, body.is_none())?;
    let actual = response.stream_id().as_u32();
    if actual != id.get() {
        stream.send_reset(h2::Reason::CANCEL);
        return Err(WriteError::IdentifierMismatch {
            expected: id,
            actual,
        });
    }
    if let Some(body) = body {
        stream.send_data(body, true)?;
    }
    Ok(response)
}
