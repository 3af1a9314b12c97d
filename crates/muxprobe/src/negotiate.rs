//! Transport negotiation: TCP connect, optional TLS with ALPN, HTTP/2 preface.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use h2::client::{Connection, SendRequest};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, NegotiationFailure};
use crate::multiplexer::StreamId;
use crate::tls::{self, ALPN_H2};

/// Byte stream the protocol engine runs over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// How HTTP/2 was entered on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `h2` selected through ALPN.
    H2,
    /// Cleartext HTTP/2 with prior knowledge.
    H2c,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H2 => write!(f, "h2"),
            Self::H2c => write!(f, "h2c"),
        }
    }
}

pub(crate) struct Negotiated {
    pub io: BoxedIo,
    pub protocol: Protocol,
    pub peer: SocketAddr,
}

/// Connect and, if configured, run the TLS handshake and check ALPN.
pub(crate) async fn negotiate(config: &HarnessConfig) -> Result<Negotiated, HarnessError> {
    let addr = config.addr();
    let connect = connect_tcp(config);
    let tcp = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(result) => result,
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {:?}", config.connect_timeout),
        )),
    }
    .map_err(|source| HarnessError::Connection {
        addr: addr.clone(),
        source,
    })?;
    let peer = tcp.peer_addr().map_err(|source| HarnessError::Connection {
        addr: addr.clone(),
        source,
    })?;
    tracing::info!(%addr, %peer, tls = config.tls, "connected");

    if !config.tls {
        return Ok(Negotiated {
            io: Box::new(tcp),
            protocol: Protocol::H2c,
            peer,
        });
    }

    let io = wrap_tls(tcp, config)
        .await
        .map_err(|reason| HarnessError::Negotiation { addr, reason })?;
    Ok(Negotiated {
        io,
        protocol: Protocol::H2,
        peer,
    })
}

async fn connect_tcp(config: &HarnessConfig) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((config.host.as_str(), config.port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} resolved to no addresses", config.host),
        )
    }))
}

async fn wrap_tls(tcp: TcpStream, config: &HarnessConfig) -> Result<BoxedIo, NegotiationFailure> {
    let client_config = tls::client_config(&config.trust)?;
    let server_name = tls::server_name(config.tls_server_name())?;
    let connector = TlsConnector::from(Arc::new(client_config));

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(NegotiationFailure::Tls)?;

    let (_, connection) = stream.get_ref();
    let selected = connection.alpn_protocol().map(<[u8]>::to_vec);
    tracing::debug!(
        alpn = ?selected.as_deref().map(String::from_utf8_lossy),
        version = ?connection.protocol_version(),
        "TLS handshake complete"
    );
    match selected.as_deref() {
        Some(ALPN_H2) => Ok(Box::new(stream)),
        _ => Err(NegotiationFailure::Alpn {
            selected: selected.map(|p| String::from_utf8_lossy(&p).into_owned()),
        }),
    }
}

/// Exchange connection prefaces. The engine numbers client streams from
/// [`StreamId::FIRST`], leaving stream 1 to upgrade exchanges.
pub(crate) async fn start_engine(
    io: BoxedIo,
    addr: &str,
) -> Result<(SendRequest<Bytes>, Connection<BoxedIo, Bytes>), HarnessError> {
    let mut builder = h2::client::Builder::new();
    builder
        .initial_stream_id(StreamId::FIRST.get())
        .enable_push(false);
    builder
        .handshake::<_, Bytes>(io)
        .await
        .map_err(|e| HarnessError::Negotiation {
            addr: addr.to_owned(),
            reason: NegotiationFailure::Preface(e),
        })
}

/// Drive the connection until it closes. Runs on the session's runtime.
pub(crate) async fn drive(connection: Connection<BoxedIo, Bytes>, addr: String) {
    match connection.await {
        Ok(()) => tracing::debug!(%addr, "connection closed"),
        Err(e) if e.is_go_away() => tracing::info!(%addr, error = %e, "peer sent GOAWAY"),
        Err(e) => tracing::warn!(%addr, error = %e, "connection ended with error"),
    }
}
