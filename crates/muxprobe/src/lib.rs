//! muxprobe: an HTTP/2 multiplexing client harness.
//!
//! A run opens one connection, negotiates HTTP/2 (over TLS with ALPN, or
//! cleartext with prior knowledge), issues several requests that are in
//! flight at the same time, and correlates every response back to the stream
//! that asked for it before a bounded deadline.
//!
//! ```text
//!   ┌─────────────┐   ┌───────────┐   ┌─────────────┐   ┌────────────┐   ┌──────┐
//!   │  negotiate  │──►│ handshake │──►│ multiplexer │──►│ correlator │──►│ gate │
//!   │ TCP/TLS/h2  │   │ SETTINGS  │   │ ids 3,5,7.. │   │ id -> slot │   │ wait │
//!   └─────────────┘   └───────────┘   └─────────────┘   └────────────┘   └──────┘
//! ```
//!
//! This crate defines:
//! - Configuration ([`HarnessConfig`], [`RequestKind`], [`TrustPolicy`])
//! - The connection session and its state machine ([`Session`], [`SessionState`])
//! - Stream identifiers and request records ([`StreamId`], [`PendingRequest`])
//! - Response correlation ([`Correlator`], [`StreamResponse`])
//! - The completion gate and its report ([`CompletionReport`])
//! - Errors ([`HarnessError`], [`ProtocolViolation`], [`StreamFailure`])
//! - The server-under-test seam ([`ServerLifecycle`])
//!
//! [`run`] strings the pieces together for the common single-batch case.

#![forbid(unsafe_code)]

mod config;
mod correlator;
mod error;
mod gate;
mod handshake;
mod harness;
mod lifecycle;
mod multiplexer;
mod negotiate;
mod session;
mod tls;

pub use config::*;
pub use correlator::*;
pub use error::*;
pub use gate::*;
pub use handshake::*;
pub use harness::*;
pub use lifecycle::*;
pub use multiplexer::*;
pub use negotiate::*;
pub use session::*;
pub use tls::*;
