//! Lifecycle of the server under test.
//!
//! The harness never starts or stops a server itself. Test setups implement
//! [`ServerLifecycle`] for whatever they run the harness against and wrap
//! their runs in [`with_server`].

use std::path::Path;

pub trait ServerLifecycle {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the server from a definition file, with an optional config file.
    fn start(&mut self, definition: &Path, config: Option<&Path>) -> Result<(), Self::Error>;

    /// Stop the server. A graceful stop lets in-flight exchanges finish.
    fn stop(&mut self, graceful: bool) -> Result<(), Self::Error>;

    fn is_running(&self) -> bool;
}

/// Start `server`, run `f` against it, then stop the server gracefully, even
/// if `f` returned an error of its own.
pub fn with_server<L, T>(
    server: &mut L,
    definition: &Path,
    config: Option<&Path>,
    f: impl FnOnce(&L) -> T,
) -> Result<T, L::Error>
where
    L: ServerLifecycle,
{
    server.start(definition, config)?;
    tracing::debug!(definition = %definition.display(), "server under test started");
    let output = f(server);
    server.stop(true)?;
    tracing::debug!("server under test stopped");
    Ok(output)
}
