//! The completion gate: one bounded wait for every slot of a batch.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;

use crate::correlator::{Correlator, ResponseSlot, StreamResponse};
use crate::error::{ProtocolViolation, StreamFailure};
use crate::multiplexer::StreamId;

/// Which streams of a batch settled, and how.
#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub responses: BTreeMap<StreamId, StreamResponse>,
    pub failures: BTreeMap<StreamId, StreamFailure>,
    /// Streams still outstanding when the gate gave up, ascending.
    pub unresolved: Vec<StreamId>,
    /// Violations recorded over the whole session up to the gate's return.
    pub violations: Vec<ProtocolViolation>,
}

impl CompletionReport {
    /// Number of streams the batch contained.
    pub fn len(&self) -> usize {
        self.responses.len() + self.failures.len() + self.unresolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stream settled, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Every stream got a response and nothing unexpected was seen.
    pub fn is_success(&self) -> bool {
        self.is_complete() && self.failures.is_empty() && self.violations.is_empty()
    }

    pub fn response(&self, id: StreamId) -> Option<&StreamResponse> {
        self.responses.get(&id)
    }

    /// Settled identifiers, ascending.
    pub fn resolved(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .responses
            .keys()
            .chain(self.failures.keys())
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug)]
pub enum GateOutcome {
    Complete(CompletionReport),
    TimedOut(CompletionReport),
}

/// Wait until every slot settles or `timeout` elapses, whichever is first.
pub async fn await_all(
    slots: Vec<ResponseSlot>,
    timeout: Duration,
    correlator: &Correlator,
) -> GateOutcome {
    let deadline = Instant::now() + timeout;
    let mut outstanding: BTreeSet<StreamId> = slots.iter().map(ResponseSlot::id).collect();
    let mut waits: FuturesUnordered<_> = slots.into_iter().map(ResponseSlot::settled).collect();
    let mut report = CompletionReport::default();

    let timed_out = loop {
        match tokio::time::timeout_at(deadline, waits.next()).await {
            Ok(Some((id, settlement))) => {
                outstanding.remove(&id);
                match settlement {
                    Some(Ok(response)) => {
                        report.responses.insert(id, response);
                    }
                    Some(Err(failure)) => {
                        report.failures.insert(id, failure);
                    }
                    None => {
                        report.failures.insert(
                            id,
                            StreamFailure::Connection("session closed before settlement".into()),
                        );
                    }
                }
                tracing::trace!(stream_id = %id, outstanding = outstanding.len(), "slot settled");
            }
            Ok(None) => break false,
            Err(_elapsed) => break true,
        }
    };

    report.unresolved = outstanding.into_iter().collect();
    report.violations = correlator.violations();

    if timed_out {
        tracing::warn!(
            ?timeout,
            unresolved = ?report.unresolved,
            resolved = report.resolved().len(),
            "completion gate timed out"
        );
        GateOutcome::TimedOut(report)
    } else {
        tracing::debug!(
            responses = report.responses.len(),
            failures = report.failures.len(),
            "completion gate passed"
        );
        GateOutcome::Complete(report)
    }
}
