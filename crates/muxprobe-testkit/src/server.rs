//! A loopback HTTP/2 server with scripted response scheduling.
//!
//! The server runs on its own runtime so blocking harness sessions can be
//! driven from plain `#[test]` functions against it.

use std::cmp::Reverse;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use h2::RecvStream;
use h2::server::SendResponse;
use http::header::{CONTENT_TYPE, HeaderName};
use http::{HeaderMap, HeaderValue, Method, Request, Response};
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::TestError;
use crate::definition::{Behavior, Route, ServerDefinition, ServerSettings};
use crate::identity::TlsIdentity;

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub stream_id: u32,
    pub method: Method,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct Shared {
    definition: ServerDefinition,
    requests: Mutex<Vec<RecordedRequest>>,
    /// Stream ids in the order their responses (or resets) were sent.
    answered: Mutex<Vec<u32>>,
    connections: AtomicUsize,
    /// Streams deliberately left unanswered.
    parked: Mutex<Vec<SendResponse<Bytes>>>,
    /// Connections held open without being served.
    silent: Mutex<Vec<TcpStream>>,
}

struct Exchange {
    request: RecordedRequest,
    respond: SendResponse<Bytes>,
}

pub struct LoopbackServer {
    addr: SocketAddr,
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
    identity: Option<TlsIdentity>,
}

impl LoopbackServer {
    /// Cleartext server with prior-knowledge HTTP/2.
    pub fn cleartext(behavior: Behavior) -> Result<Self, TestError> {
        Self::start(ServerDefinition::new(behavior), ServerSettings::default())
    }

    pub fn start(definition: ServerDefinition, settings: ServerSettings) -> Result<Self, TestError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("muxprobe-testkit")
            .enable_all()
            .build()?;

        let identity = if settings.tls {
            Some(TlsIdentity::generate(&settings.server_names)?)
        } else {
            None
        };
        let acceptor = identity
            .as_ref()
            .map(|identity| identity.acceptor(&settings.alpn))
            .transpose()?;

        let listener = runtime.block_on(TcpListener::bind(settings.bind.as_str()))?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, tls = settings.tls, behavior = ?definition.behavior, "loopback server listening");

        let shared = Arc::new(Shared {
            definition,
            requests: Mutex::new(Vec::new()),
            answered: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            parked: Mutex::new(Vec::new()),
            silent: Mutex::new(Vec::new()),
        });
        runtime.spawn(accept_loop(listener, acceptor, shared.clone()));

        Ok(Self {
            addr,
            runtime: Some(runtime),
            shared,
            identity,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The self-signed certificate, when serving TLS.
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.identity.as_ref().map(TlsIdentity::certificate)
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Requests read so far, in the order they finished arriving.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.requests.lock().clone()
    }

    /// Stream ids in the order the server answered them.
    pub fn answered(&self) -> Vec<u32> {
        self.shared.answered.lock().clone()
    }

    /// Poll until at least `n` requests were read or `timeout` passes.
    pub fn wait_for_requests(&self, n: usize, timeout: Duration) -> Vec<RecordedRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let requests = self.requests();
            if requests.len() >= n || Instant::now() >= deadline {
                return requests;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn shutdown(mut self, graceful: bool) {
        self.stop(graceful);
    }

    fn stop(&mut self, graceful: bool) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if graceful {
            runtime.shutdown_timeout(Duration::from_secs(1));
        } else {
            runtime.shutdown_background();
        }
        self.shared.parked.lock().clear();
        self.shared.silent.lock().clear();
        tracing::info!(addr = %self.addr, graceful, "loopback server stopped");
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.stop(false);
    }
}

async fn accept_loop(listener: TcpListener, acceptor: Option<TlsAcceptor>, shared: Arc<Shared>) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        shared.connections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%peer, "accepted connection");

        let acceptor = acceptor.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(tcp, acceptor, shared).await {
                tracing::debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    tcp: TcpStream,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) -> Result<(), TestError> {
    match shared.definition.behavior {
        Behavior::Silent => {
            shared.silent.lock().push(tcp);
            return Ok(());
        }
        Behavior::Hangup => {
            tracing::debug!("hanging up");
            drop(tcp);
            return Ok(());
        }
        _ => {}
    }
    match acceptor {
        Some(acceptor) => serve_h2(acceptor.accept(tcp).await?, shared).await,
        None => serve_h2(tcp, shared).await,
    }
}

async fn serve_h2<T>(io: T, shared: Arc<Shared>) -> Result<(), TestError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection = h2::server::handshake(io).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(respond_loop(rx, shared.clone()));

    while let Some(accepted) = connection.accept().await {
        let (request, respond) = accepted?;
        let tx = tx.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let stream_id = respond.stream_id().as_u32();
            match read_request(stream_id, request).await {
                Ok(request) => {
                    tracing::debug!(stream_id, path = %request.path, "request read");
                    shared.requests.lock().push(request.clone());
                    let _ = tx.send(Exchange { request, respond });
                }
                Err(e) => tracing::debug!(stream_id, error = %e, "request body failed"),
            }
        });
    }
    Ok(())
}

async fn read_request(stream_id: u32, request: Request<RecvStream>) -> Result<RecordedRequest, h2::Error> {
    let (parts, mut body) = request.into_parts();
    let mut data = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        body.flow_control().release_capacity(chunk.len())?;
        data.extend_from_slice(&chunk);
    }
    Ok(RecordedRequest {
        stream_id,
        method: parts.method,
        scheme: parts.uri.scheme_str().map(str::to_owned),
        authority: parts.uri.authority().map(|a| a.to_string()),
        path: parts.uri.path().to_owned(),
        headers: parts.headers,
        body: data.freeze(),
    })
}

async fn respond_loop(mut rx: mpsc::UnboundedReceiver<Exchange>, shared: Arc<Shared>) {
    let mut held: Vec<Exchange> = Vec::new();
    while let Some(exchange) = rx.recv().await {
        match &shared.definition.behavior {
            Behavior::Ignore { path } if *path == exchange.request.path => {
                tracing::debug!(stream_id = exchange.request.stream_id, "leaving stream unanswered");
                shared.parked.lock().push(exchange.respond);
            }
            Behavior::Reset { path } if *path == exchange.request.path => {
                let Exchange { request, mut respond } = exchange;
                tracing::debug!(stream_id = request.stream_id, "refusing stream");
                respond.send_reset(h2::Reason::REFUSED_STREAM);
                shared.answered.lock().push(request.stream_id);
            }
            Behavior::Reversed { batch } => {
                held.push(exchange);
                if held.len() >= (*batch).max(1) {
                    held.sort_by_key(|e| Reverse(e.request.stream_id));
                    for exchange in held.drain(..) {
                        respond(exchange, &shared);
                    }
                }
            }
            _ => respond(exchange, &shared),
        }
    }
}

fn respond(exchange: Exchange, shared: &Shared) {
    let stream_id = exchange.request.stream_id;
    match try_respond(exchange, &shared.definition.routes) {
        Ok(()) => shared.answered.lock().push(stream_id),
        Err(e) => tracing::warn!(stream_id, error = %e, "failed to respond"),
    }
}

fn try_respond(exchange: Exchange, routes: &[Route]) -> Result<(), TestError> {
    let Exchange {
        request,
        mut respond,
    } = exchange;
    let default_body = || format!("{} {}", request.method, request.path);
    let (status, body, trailers) = match routes.iter().find(|r| r.path == request.path) {
        Some(route) => (
            route.status,
            route.body.clone().unwrap_or_else(default_body),
            trailer_map(route)?,
        ),
        None if routes.is_empty() => (200, default_body(), None),
        None => (404, "not found".to_owned(), None),
    };

    let response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(())?;
    let body = if request.method == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from(body)
    };

    let end_on_headers = body.is_empty() && trailers.is_none();
    let mut stream = respond.send_response(response, end_on_headers)?;
    if end_on_headers {
        return Ok(());
    }
    stream.send_data(body, trailers.is_none())?;
    if let Some(trailers) = trailers {
        stream.send_trailers(trailers)?;
    }
    Ok(())
}

fn trailer_map(route: &Route) -> Result<Option<HeaderMap>, TestError> {
    if route.trailers.is_empty() {
        return Ok(None);
    }
    let mut map = HeaderMap::new();
    for (name, value) in &route.trailers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?,
            HeaderValue::from_str(value).map_err(http::Error::from)?,
        );
    }
    Ok(Some(map))
}
