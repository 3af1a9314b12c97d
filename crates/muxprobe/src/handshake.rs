//! Bounded wait for the peer's SETTINGS.
//!
//! The server preface is a SETTINGS frame and always precedes any PONG, and
//! the engine applies SETTINGS as it reads them. A completed PING round trip
//! therefore means the peer's settings are in effect.

use std::time::Duration;

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use tokio::time::Instant;

use crate::error::HarnessError;

/// What the handshake learned about the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    /// Concurrent streams the peer lets us open.
    pub max_concurrent_streams: usize,
    /// Round trip of the settling PING.
    pub rtt: Duration,
}

pub(crate) async fn await_settings(
    send: &SendRequest<Bytes>,
    ping_pong: &mut PingPong,
    timeout: Duration,
    addr: &str,
) -> Result<PeerSettings, HarnessError> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, ping_pong.ping(Ping::opaque())).await {
        Ok(Ok(_pong)) => {
            let settings = PeerSettings {
                max_concurrent_streams: send.current_max_send_streams(),
                rtt: started.elapsed(),
            };
            tracing::info!(
                %addr,
                max_concurrent_streams = settings.max_concurrent_streams,
                rtt = ?settings.rtt,
                "peer settings applied"
            );
            Ok(settings)
        }
        Ok(Err(source)) => Err(HarnessError::ConnectionLost {
            addr: addr.to_owned(),
            source,
        }),
        Err(_elapsed) => Err(HarnessError::HandshakeTimeout {
            addr: addr.to_owned(),
            timeout,
        }),
    }
}
