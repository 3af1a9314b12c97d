//! Server definitions and settings, loadable from JSON.
//!
//! ```json
//! {
//!   "behavior": { "kind": "reversed", "batch": 3 },
//!   "routes": [
//!     { "path": "/pizzashack/1.0.0/menu", "status": 200, "body": "[]" }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::TestError;

/// How the server schedules its responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Answer every request as soon as it has been read.
    #[default]
    InOrder,
    /// Hold requests until `batch` have arrived, then answer them highest
    /// stream id first.
    Reversed { batch: usize },
    /// Never answer requests for `path`; the streams stay open.
    Ignore { path: String },
    /// Refuse requests for `path` with `RST_STREAM(REFUSED_STREAM)`.
    Reset { path: String },
    /// Accept TCP connections and never read or write on them.
    Silent,
    /// Accept TCP connections and close them straight away.
    Hangup,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub path: String,
    #[serde(default = "Route::ok")]
    pub status: u16,
    /// Response body. Defaults to `"{METHOD} {path}"` of the request.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub trailers: BTreeMap<String, String>,
}

impl Route {
    fn ok() -> u16 {
        200
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: Self::ok(),
            body: None,
            trailers: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.insert(name.into(), value.into());
        self
    }
}

/// What the server does. With no routes, every path answers 200.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerDefinition {
    pub behavior: Behavior,
    pub routes: Vec<Route>,
}

impl ServerDefinition {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            routes: Vec::new(),
        }
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn load(path: &Path) -> Result<Self, TestError> {
        load_json(path)
    }
}

/// Where and how the server listens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub tls: bool,
    /// ALPN protocols the server will select from.
    pub alpn: Vec<String>,
    /// Subject alternative names of the generated certificate.
    pub server_names: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_owned(),
            tls: false,
            alpn: vec!["h2".to_owned()],
            server_names: vec!["localhost".to_owned(), "127.0.0.1".to_owned()],
        }
    }
}

impl ServerSettings {
    pub fn tls() -> Self {
        Self {
            tls: true,
            ..Self::default()
        }
    }

    pub fn with_alpn(mut self, alpn: &[&str]) -> Self {
        self.alpn = alpn.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    pub fn load(path: &Path) -> Result<Self, TestError> {
        load_json(path)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, TestError> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| TestError::Definition {
        path: path.to_owned(),
        source,
    })
}
