//! Error taxonomy for harness runs.
//!
//! Connection, negotiation and handshake failures are fatal to a session.
//! Protocol violations are recorded by the correlator and surfaced in the
//! completion report. A response timeout is terminal but carries the report of
//! which streams settled, so the caller decides what partial completion means.

use std::time::Duration;

use crate::gate::CompletionReport;
use crate::multiplexer::StreamId;
use crate::session::SessionState;

/// Errors surfaced by a harness session.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The TCP connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS, ALPN or the HTTP/2 preface exchange failed.
    #[error("negotiation with {addr} failed: {reason}")]
    Negotiation {
        addr: String,
        #[source]
        reason: NegotiationFailure,
    },

    /// The peer's SETTINGS did not arrive in time.
    #[error("{addr} did not complete the settings exchange within {timeout:?}")]
    HandshakeTimeout { addr: String, timeout: Duration },

    /// The connection broke while the session was waiting on it.
    #[error("connection to {addr} lost: {source}")]
    ConnectionLost {
        addr: String,
        #[source]
        source: h2::Error,
    },

    /// A delivery did not match the correlator table.
    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),

    /// The completion gate's deadline elapsed with streams still outstanding.
    #[error(
        "{addr}: {} of {} streams unresolved after {timeout:?}: {:?}",
        .report.unresolved.len(),
        .report.len(),
        .report.unresolved
    )]
    ResponseTimeout {
        addr: String,
        timeout: Duration,
        report: CompletionReport,
    },

    /// A request could not be placed on the wire.
    #[error("{addr}: stream {id}: {source}")]
    Write {
        addr: String,
        id: StreamId,
        #[source]
        source: WriteError,
    },

    /// The dedicated execution context could not be created.
    #[error("failed to build the session runtime for {addr}: {source}")]
    Runtime {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The request descriptor could not be turned into a request.
    #[error("invalid request for {addr}: {source}")]
    InvalidRequest {
        addr: String,
        #[source]
        source: http::Error,
    },

    /// The operation is not allowed in the session's current state.
    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    /// The session ran out of client-initiated stream identifiers.
    #[error("{addr}: stream identifiers exhausted")]
    StreamIdsExhausted { addr: String },
}

impl HarnessError {
    /// Whether the error aborts the session.
    ///
    /// Timeouts on the response path and protocol violations leave the
    /// connection usable; everything that breaks the transport does not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Negotiation { .. }
                | Self::HandshakeTimeout { .. }
                | Self::ConnectionLost { .. }
                | Self::Runtime { .. }
        )
    }

    /// The completion report attached to a response timeout, if any.
    pub fn report(&self) -> Option<&CompletionReport> {
        match self {
            Self::ResponseTimeout { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Why TLS or protocol negotiation failed.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationFailure {
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("could not build TLS configuration: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("could not load trust anchors: {0}")]
    TrustStore(#[source] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("peer selected {}, expected h2", .selected.as_deref().unwrap_or("no application protocol"))]
    Alpn { selected: Option<String> },

    #[error("HTTP/2 preface exchange failed: {0}")]
    Preface(#[source] h2::Error),
}

/// Kind of correlator violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// A settlement arrived for an identifier that was never registered.
    UnknownStream,
    /// A second settlement arrived for an identifier already settled.
    DuplicateResolution,
    /// The same identifier was registered twice.
    DuplicateRegistration,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownStream => write!(f, "delivery for unregistered stream"),
            Self::DuplicateResolution => write!(f, "duplicate resolution"),
            Self::DuplicateRegistration => write!(f, "duplicate registration"),
        }
    }
}

/// A delivery or registration that did not match the correlator table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation on stream {id}: {kind}")]
pub struct ProtocolViolation {
    pub id: StreamId,
    pub kind: ViolationKind,
}

/// Failure to hand a request to the protocol engine.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("engine rejected the request: {0}")]
    Engine(#[from] h2::Error),

    #[error("engine opened stream {actual} instead of {expected}")]
    IdentifierMismatch { expected: StreamId, actual: u32 },

    #[error("session closed before the request was written")]
    Closed,
}

/// Why a written stream settled without a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamFailure {
    #[error("stream reset by peer: {0:?}")]
    Reset(h2::Reason),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("write failed: {0}")]
    Write(String),
}

impl From<h2::Error> for StreamFailure {
    fn from(e: h2::Error) -> Self {
        match e.reason() {
            Some(reason) if e.is_reset() => Self::Reset(reason),
            _ => Self::Connection(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        let refused = HarnessError::Connection {
            addr: "127.0.0.1:9590".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_fatal());
        assert!(refused.to_string().contains("127.0.0.1:9590"));

        let handshake = HarnessError::HandshakeTimeout {
            addr: "127.0.0.1:9590".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(handshake.is_fatal());

        let runtime = HarnessError::Runtime {
            addr: "127.0.0.1:9590".into(),
            source: std::io::Error::other("no threads"),
        };
        assert!(runtime.is_fatal());
        assert!(runtime.to_string().contains("127.0.0.1:9590"));

        let violation = HarnessError::from(ProtocolViolation {
            id: StreamId::FIRST,
            kind: ViolationKind::UnknownStream,
        });
        assert!(!violation.is_fatal());
        assert!(violation.to_string().contains("stream 3"));
    }

    #[test]
    fn alpn_failure_names_selected_protocol() {
        let none = NegotiationFailure::Alpn { selected: None };
        assert_eq!(
            none.to_string(),
            "peer selected no application protocol, expected h2"
        );
        let legacy = NegotiationFailure::Alpn {
            selected: Some("http/1.1".into()),
        };
        assert_eq!(legacy.to_string(), "peer selected http/1.1, expected h2");
    }
}
