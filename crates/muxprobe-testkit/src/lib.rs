//! muxprobe-testkit: loopback HTTP/2 peers for exercising harness sessions.
//!
//! [`LoopbackServer`] answers (or deliberately does not answer) requests
//! according to a [`Behavior`], over cleartext or TLS with a generated
//! certificate, and records every request it reads. [`TestServer`] wraps it
//! behind [`muxprobe::ServerLifecycle`] so setups can start it from JSON
//! definition files.
//!
//! # Usage
//!
//! ```ignore
//! use muxprobe::{HarnessConfig, run};
//! use muxprobe_testkit::{Behavior, LoopbackServer};
//!
//! let server = LoopbackServer::cleartext(Behavior::InOrder)?;
//! let report = run(&HarnessConfig::new("127.0.0.1", server.port()).with_count(3))?;
//! assert!(report.is_success());
//! ```

use std::path::{Path, PathBuf};

use muxprobe::ServerLifecycle;

mod definition;
mod identity;
mod server;

pub use definition::*;
pub use identity::*;
pub use server::*;

#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("invalid definition {}: {source}", .path.display())]
    Definition {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,
}

/// A [`LoopbackServer`] managed through [`ServerLifecycle`].
#[derive(Default)]
pub struct TestServer {
    server: Option<LoopbackServer>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(&self) -> Option<&LoopbackServer> {
        self.server.as_ref()
    }
}

impl ServerLifecycle for TestServer {
    type Error = TestError;

    fn start(&mut self, definition: &Path, config: Option<&Path>) -> Result<(), TestError> {
        if self.server.is_some() {
            return Err(TestError::AlreadyRunning);
        }
        let definition = ServerDefinition::load(definition)?;
        let settings = config
            .map(ServerSettings::load)
            .transpose()?
            .unwrap_or_default();
        self.server = Some(LoopbackServer::start(definition, settings)?);
        Ok(())
    }

    fn stop(&mut self, graceful: bool) -> Result<(), TestError> {
        let server = self.server.take().ok_or(TestError::NotRunning)?;
        server.shutdown(graceful);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.server.is_some()
    }
}
