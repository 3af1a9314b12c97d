//! One-shot runs: a whole session from connect to close.

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::gate::CompletionReport;
use crate::session::Session;

/// Run one complete exchange: connect, wait for the peer's settings, issue
/// `config.count` requests in a single flush, wait for all of them, close.
///
/// The session is closed on every path, including errors.
pub fn run(config: &HarnessConfig) -> Result<CompletionReport, HarnessError> {
    let span = tracing::info_span!("run", addr = %config.addr(), count = config.count);
    let _enter = span.enter();

    let mut session = Session::new(config.clone());
    let result = exchange(&mut session, config);
    session.close();
    result
}

fn exchange(session: &mut Session, config: &HarnessConfig) -> Result<CompletionReport, HarnessError> {
    session.connect()?;
    session.await_handshake()?;
    if config.count == 0 {
        return Ok(CompletionReport::default());
    }
    for _ in 0..config.count {
        session.queue(config.request.clone(), &config.path)?;
    }
    session.flush()?;
    session.await_completion()
}
