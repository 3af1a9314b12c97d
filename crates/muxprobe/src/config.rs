//! Harness configuration.
//!
//! One [`HarnessConfig`] value describes a whole run: where to connect, how to
//! negotiate, what to send and how long each bounded wait may take. The binary
//! builds it from CLI flags and `MUXPROBE_*` environment variables; library
//! callers use [`Default`] plus the `with_*` methods.

use std::time::Duration;

use bytes::Bytes;
use http::Method;
use http::uri::Scheme;

use crate::tls::TrustPolicy;

/// Host targeted when none is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port of the gateway under test by default.
pub const DEFAULT_PORT: u16 = 9590;

/// Request path exercised by default.
pub const DEFAULT_PATH: &str = "/pizzashack/1.0.0/menu";

/// Default bound for the handshake and completion waits.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// What kind of request each stream carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestKind {
    #[default]
    Get,
    Head,
    Options,
    Post { body: Bytes },
}

impl RequestKind {
    pub fn method(&self) -> Method {
        match self {
            Self::Get => Method::GET,
            Self::Head => Method::HEAD,
            Self::Options => Method::OPTIONS,
            Self::Post { .. } => Method::POST,
        }
    }

    /// Request body, if the kind carries one.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            Self::Post { body } => Some(body),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub host: String,
    pub port: u16,
    /// Wrap the connection in TLS and negotiate `h2` via ALPN. Cleartext runs
    /// use HTTP/2 with prior knowledge.
    pub tls: bool,
    pub trust: TrustPolicy,
    /// Name to verify the server certificate against, when it differs from `host`.
    pub server_name: Option<String>,
    /// Sent as `authorization: Bearer <token>` when present.
    pub token: Option<String>,
    pub path: String,
    pub request: RequestKind,
    /// Number of streams issued in the single batch of a [`crate::run`].
    pub count: usize,
    /// Values for the `accept-encoding` header, in preference order.
    pub accept_encodings: Vec<String>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub response_timeout: Duration,
    /// Grace period for the connection to wind down before the runtime is
    /// shut down.
    pub shutdown_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            tls: false,
            trust: TrustPolicy::default(),
            server_name: None,
            token: None,
            path: DEFAULT_PATH.to_owned(),
            request: RequestKind::Get,
            count: 1,
            accept_encodings: vec!["gzip".to_owned(), "deflate".to_owned()],
            connect_timeout: DEFAULT_WAIT,
            handshake_timeout: DEFAULT_WAIT,
            response_timeout: DEFAULT_WAIT,
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

impl HarnessConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, trust: TrustPolicy) -> Self {
        self.tls = true;
        self.trust = trust;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_request(mut self, request: RequestKind) -> Self {
        self.request = request;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// `host:port`, used in logs and error context.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the `:authority` pseudo-header. IPv6 literals are bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            self.addr()
        }
    }

    /// Value of the `:scheme` pseudo-header.
    pub fn scheme(&self) -> Scheme {
        if self.tls { Scheme::HTTPS } else { Scheme::HTTP }
    }

    /// Name presented in SNI and used for certificate verification.
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_local_gateway() {
        let config = HarnessConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:9590");
        assert_eq!(config.path, "/pizzashack/1.0.0/menu");
        assert!(!config.tls);
        assert_eq!(config.scheme(), Scheme::HTTP);
        assert_eq!(config.request, RequestKind::Get);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert!(config.accept_encodings.len() >= 2);
    }

    #[test]
    fn ipv6_authority_is_bracketed() {
        let config = HarnessConfig::new("::1", 8443);
        assert_eq!(config.authority(), "[::1]:8443");
        assert_eq!(config.addr(), "::1:8443");
    }

    #[test]
    fn tls_switches_scheme_and_server_name() {
        let config = HarnessConfig::new("127.0.0.1", 8443)
            .with_tls(TrustPolicy::AcceptAny)
            .with_server_name("localhost");
        assert_eq!(config.scheme(), Scheme::HTTPS);
        assert_eq!(config.tls_server_name(), "localhost");
    }

    #[test]
    fn request_kinds_map_to_methods() {
        assert_eq!(RequestKind::Head.method(), Method::HEAD);
        assert_eq!(RequestKind::Options.method(), Method::OPTIONS);
        let post = RequestKind::Post {
            body: Bytes::from_static(b"test data!"),
        };
        assert_eq!(post.method(), Method::POST);
        assert_eq!(post.body().map(|b| b.as_ref()), Some(&b"test data!"[..]));
        assert!(RequestKind::Get.body().is_none());
    }
}
