//! One HTTP/2 connection and the batches issued over it.
//!
//! ```text
//! Disconnected ─connect()─► Negotiating ─► HandshakeAwaiting
//!                                               │ await_handshake()
//!                                               ▼
//!        ┌──────────────────────────────────► Ready
//!        │                                      │ queue()
//!        │                                      ▼
//!        │ gate returns                    Sending { in_flight }
//!        │                                      │ await_completion()
//!        └──────────────────────────── AwaitingCompletion
//!
//!                  close() / drop / fatal error ─► Closed
//! ```
//!
//! A session owns a single-worker tokio runtime. Connection driving, request
//! writing and response collection run there; the caller's thread only blocks
//! in [`Session::connect`], [`Session::await_handshake`] and
//! [`Session::await_completion`]. The runtime is shut down exactly once, on
//! entry to `Closed`.
//!
//! A session is a blocking API and must not be driven from inside another
//! tokio runtime.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use h2::PingPong;
use h2::client::SendRequest;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{HarnessConfig, RequestKind};
use crate::correlator::{Correlator, ResponseSlot};
use crate::error::{HarnessError, StreamFailure, WriteError};
use crate::gate::{self, CompletionReport, GateOutcome};
use crate::handshake::{self, PeerSettings};
use crate::multiplexer::{
    self, Outbound, PendingRequest, RequestDescriptor, StreamId, StreamIdAllocator, WriteHandle,
};
use crate::negotiate::{self, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Negotiating,
    HandshakeAwaiting,
    Ready,
    Sending { in_flight: usize },
    AwaitingCompletion,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::HandshakeAwaiting => write!(f, "awaiting handshake"),
            Self::Ready => write!(f, "ready"),
            Self::Sending { in_flight } => write!(f, "sending ({in_flight} in flight)"),
            Self::AwaitingCompletion => write!(f, "awaiting completion"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

pub struct Session {
    config: HarnessConfig,
    addr: String,
    state: SessionState,
    runtime: Option<Runtime>,

    protocol: Option<Protocol>,
    peer: Option<SocketAddr>,
    peer_settings: Option<PeerSettings>,

    ids: StreamIdAllocator,
    correlator: Arc<Correlator>,

    /// Engine handle between the preface exchange and the handshake; moves
    /// into the writer task once the peer's settings are in.
    engine: Option<SendRequest<Bytes>>,
    ping_pong: Option<PingPong>,
    driver: Option<JoinHandle<()>>,
    writer: Option<mpsc::UnboundedSender<Vec<Outbound>>>,

    /// Requests queued since the last flush.
    queued: Vec<Outbound>,
    /// Records and slots of the current batch.
    requests: Vec<PendingRequest>,
    slots: Vec<ResponseSlot>,
}

impl Session {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            addr: config.addr(),
            config,
            state: SessionState::Disconnected,
            runtime: None,
            protocol: None,
            peer: None,
            peer_settings: None,
            ids: StreamIdAllocator::new(),
            correlator: Arc::new(Correlator::new()),
            engine: None,
            ping_pong: None,
            driver: None,
            writer: None,
            queued: Vec::new(),
            requests: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// `host:port` of the configured peer.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_tls(&self) -> bool {
        self.config.tls
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn peer_settings(&self) -> Option<PeerSettings> {
        self.peer_settings
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Records of the current (or most recently completed) batch.
    pub fn requests(&self) -> &[PendingRequest] {
        &self.requests
    }

    /// Whether the session still owns its execution context.
    pub fn has_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    fn invalid_state(&self, operation: &'static str) -> HarnessError {
        HarnessError::InvalidState {
            state: self.state,
            operation,
        }
    }

    fn runtime(&self, operation: &'static str) -> Result<&Runtime, HarnessError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| self.invalid_state(operation))
    }

    /// Fatal errors close the session before they are returned.
    fn fail<T>(&mut self, error: HarnessError) -> Result<T, HarnessError> {
        if error.is_fatal() {
            tracing::error!(addr = %self.addr, %error, "session failed");
            self.close();
        }
        Err(error)
    }

    /// Connect, negotiate and exchange connection prefaces.
    pub fn connect(&mut self) -> Result<(), HarnessError> {
        if self.state != SessionState::Disconnected {
            return Err(self.invalid_state("connect"));
        }

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("muxprobe-io")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(source) => {
                return self.fail(HarnessError::Runtime {
                    addr: self.addr.clone(),
                    source,
                });
            }
        };
        self.state = SessionState::Negotiating;

        let config = &self.config;
        let addr = self.addr.clone();
        let result = runtime.block_on(async {
            let negotiated = negotiate::negotiate(config).await?;
            let (engine, mut connection) = negotiate::start_engine(negotiated.io, &addr).await?;
            let ping_pong = connection.ping_pong();
            let driver = tokio::spawn(negotiate::drive(connection, addr.clone()));
            Ok::<_, HarnessError>((negotiated.protocol, negotiated.peer, engine, ping_pong, driver))
        });
        self.runtime = Some(runtime);

        let (protocol, peer, engine, ping_pong, driver) = match result {
            Ok(connected) => connected,
            Err(e) => return self.fail(e),
        };
        tracing::info!(addr = %self.addr, %protocol, %peer, "HTTP/2 preface sent");
        self.protocol = Some(protocol);
        self.peer = Some(peer);
        self.engine = Some(engine);
        self.ping_pong = ping_pong;
        self.driver = Some(driver);
        self.state = SessionState::HandshakeAwaiting;
        Ok(())
    }

    /// Block until the peer's SETTINGS are applied, then start the writer.
    pub fn await_handshake(&mut self) -> Result<PeerSettings, HarnessError> {
        if self.state != SessionState::HandshakeAwaiting {
            return Err(self.invalid_state("await_handshake"));
        }
        let (Some(engine), Some(mut ping_pong)) = (self.engine.take(), self.ping_pong.take()) else {
            return Err(self.invalid_state("await_handshake"));
        };

        let timeout = self.config.handshake_timeout;
        let result = self.runtime("await_handshake")?.block_on(handshake::await_settings(
            &engine,
            &mut ping_pong,
            timeout,
            &self.addr,
        ));
        let settings = match result {
            Ok(settings) => settings,
            Err(e) => {
                drop((engine, ping_pong));
                return self.fail(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime("await_handshake")?.spawn(multiplexer::write_batches(
            engine,
            rx,
            self.correlator.clone(),
            self.addr.clone(),
        ));
        self.writer = Some(tx);
        self.peer_settings = Some(settings);
        self.state = SessionState::Ready;
        Ok(settings)
    }

    /// Queue a request. Nothing reaches the wire until [`Session::flush`].
    ///
    /// The request is built before an identifier is assigned, so a rejected
    /// request leaves no gap between assigned and wire identifiers.
    pub fn queue(&mut self, kind: RequestKind, path: &str) -> Result<StreamId, HarnessError> {
        let in_flight = match self.state {
            SessionState::Ready => {
                self.requests.clear();
                0
            }
            SessionState::Sending { in_flight } => in_flight,
            _ => return Err(self.invalid_state("queue")),
        };

        let invalid = |source| HarnessError::InvalidRequest {
            addr: self.addr.clone(),
            source,
        };
        let descriptor = RequestDescriptor::new(&self.config, &kind, path).map_err(invalid)?;
        let request = descriptor.to_request().map_err(invalid)?;

        let id = self.ids.next().ok_or_else(|| HarnessError::StreamIdsExhausted {
            addr: self.addr.clone(),
        })?;
        let slot = self.correlator.register(id)?;
        let (written, handle) = WriteHandle::channel();

        tracing::debug!(
            stream_id = %id,
            method = %descriptor.method,
            path = %descriptor.path,
            "queued request"
        );
        self.queued.push(Outbound {
            id,
            request,
            body: descriptor.body.clone(),
            written,
        });
        self.requests.push(PendingRequest::new(id, descriptor, handle));
        self.slots.push(slot);
        self.state = SessionState::Sending {
            in_flight: in_flight + 1,
        };
        Ok(id)
    }

    /// Hand every queued request to the writer in one batch. Returns the
    /// batch size.
    pub fn flush(&mut self) -> Result<usize, HarnessError> {
        if !matches!(self.state, SessionState::Sending { .. }) {
            return Err(self.invalid_state("flush"));
        }
        let batch = std::mem::take(&mut self.queued);
        let len = batch.len();
        if len == 0 {
            return Ok(0);
        }

        let sent = match &self.writer {
            Some(writer) => writer.send(batch).map_err(|e| e.0),
            None => Err(batch),
        };
        if let Err(batch) = sent {
            tracing::warn!(addr = %self.addr, batch_len = len, "writer is gone; failing batch");
            for outbound in batch {
                let _ = outbound.written.send(Err(WriteError::Closed));
                let _ = self.correlator.deliver(
                    outbound.id,
                    Err(StreamFailure::Write(WriteError::Closed.to_string())),
                );
            }
        }
        tracing::debug!(addr = %self.addr, batch_len = len, "flushed batch");
        Ok(len)
    }

    /// Block until every request of the current batch has been handed to
    /// the engine, bounded by the response timeout. Returns how many were
    /// written; the first write failure is returned as an error.
    pub fn await_written(&mut self) -> Result<usize, HarnessError> {
        if !self.queued.is_empty()
            || !matches!(self.state, SessionState::Sending { .. } | SessionState::Ready)
        {
            return Err(self.invalid_state("await_written"));
        }
        let handles: Vec<(StreamId, WriteHandle)> = self
            .requests
            .iter_mut()
            .filter_map(|request| Some((request.id(), request.take_write_handle()?)))
            .collect();

        let deadline = tokio::time::Instant::now() + self.config.response_timeout;
        let result = self.runtime("await_written")?.block_on(async {
            let mut written = 0;
            for (id, handle) in handles {
                match tokio::time::timeout_at(deadline, handle.wait()).await {
                    Ok(Ok(())) => written += 1,
                    Ok(Err(source)) => return Err((id, source)),
                    Err(_elapsed) => break,
                }
            }
            Ok(written)
        });
        result.map_err(|(id, source)| HarnessError::Write {
            addr: self.addr.clone(),
            id,
            source,
        })
    }

    /// Flush anything still queued, then wait for every slot of the batch.
    ///
    /// On timeout the error carries the report; the session returns to
    /// `Ready` either way.
    pub fn await_completion(&mut self) -> Result<CompletionReport, HarnessError> {
        if !matches!(self.state, SessionState::Sending { .. }) {
            return Err(self.invalid_state("await_completion"));
        }
        if !self.queued.is_empty() {
            self.flush()?;
        }
        self.state = SessionState::AwaitingCompletion;

        let slots = std::mem::take(&mut self.slots);
        let timeout = self.config.response_timeout;
        tracing::debug!(addr = %self.addr, streams = slots.len(), ?timeout, "awaiting completion");
        let outcome = self
            .runtime("await_completion")?
            .block_on(gate::await_all(slots, timeout, &self.correlator));
        self.state = SessionState::Ready;

        match outcome {
            GateOutcome::Complete(report) => Ok(report),
            GateOutcome::TimedOut(report) => Err(HarnessError::ResponseTimeout {
                addr: self.addr.clone(),
                timeout,
                report,
            }),
        }
    }

    /// Close the connection and shut the runtime down. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);

        // Dropping every engine handle lets the driver send GOAWAY and finish.
        self.queued.clear();
        self.slots.clear();
        self.writer = None;
        self.engine = None;
        self.ping_pong = None;

        let grace = self.config.shutdown_timeout;
        if let Some(runtime) = self.runtime.take() {
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                if let Some(driver) = self.driver.take() {
                    let _ = runtime.block_on(async { tokio::time::timeout(grace, driver).await });
                }
                runtime.shutdown_timeout(grace);
            }
        }
        self.driver = None;
        tracing::info!(addr = %self.addr, from = %previous, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("protocol", &self.protocol)
            .field("next_id", &self.ids.peek())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_out_of_order_are_rejected() {
        let mut session = Session::new(HarnessConfig::new("127.0.0.1", 9));
        assert!(matches!(
            session.queue(RequestKind::Get, "/"),
            Err(HarnessError::InvalidState {
                state: SessionState::Disconnected,
                operation: "queue"
            })
        ));
        assert!(matches!(
            session.await_handshake(),
            Err(HarnessError::InvalidState { .. })
        ));
        assert!(matches!(session.flush(), Err(HarnessError::InvalidState { .. })));
    }

    #[test]
    fn close_is_idempotent_and_terminal() {
        let mut session = Session::new(HarnessConfig::default());
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.has_runtime());
        assert!(matches!(
            session.connect(),
            Err(HarnessError::InvalidState {
                state: SessionState::Closed,
                ..
            })
        ));
    }

    #[test]
    fn refused_connection_tears_down_the_runtime() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = Session::new(HarnessConfig::new("127.0.0.1", port));
        let err = session.connect().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.has_runtime());
    }

    #[test]
    fn state_names_read_naturally() {
        assert_eq!(
            SessionState::Sending { in_flight: 2 }.to_string(),
            "sending (2 in flight)"
        );
        assert_eq!(SessionState::HandshakeAwaiting.to_string(), "awaiting handshake");
    }
}
