//! Response correlation: stream identifier -> single-resolution slot.
//!
//! ```text
//!   caller thread                        session runtime
//!   ─────────────                        ───────────────
//!   queue() ── register(id) ──┐
//!                             ▼
//!             awaiting: HashMap<StreamId, Sender>
//!                             ▲
//!   gate ◄── ResponseSlot ◄───┴── deliver(id, settlement) ◄── receive task
//! ```
//!
//! Registration happens before the request is handed to the writer, so a
//! response can never race ahead of its slot. Identifiers are registered in
//! ascending order and a slot leaves the table when it settles, so the table
//! only ever holds outstanding streams. An identifier at or below the highest
//! registration that is no longer in the table has already settled. Anything
//! that does not match is recorded as a [`ProtocolViolation`] and the session
//! carries on.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use h2::client::ResponseFuture;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ProtocolViolation, StreamFailure, ViolationKind};
use crate::multiplexer::StreamId;

/// Headers, data and trailers received on one stream.
#[derive(Debug, Clone)]
pub struct StreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

/// What a slot settles with.
pub type Settlement = Result<StreamResponse, StreamFailure>;

/// The receiving half of a registered slot, consumed by the completion gate.
#[derive(Debug)]
pub struct ResponseSlot {
    id: StreamId,
    rx: oneshot::Receiver<Settlement>,
}

impl ResponseSlot {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Wait for the settlement. `None` if the correlator went away first.
    pub async fn settled(self) -> (StreamId, Option<Settlement>) {
        (self.id, self.rx.await.ok())
    }
}

#[derive(Default)]
struct Table {
    awaiting: HashMap<StreamId, oneshot::Sender<Settlement>>,
    /// Highest identifier ever registered.
    highest: Option<StreamId>,
}

impl Table {
    fn was_registered(&self, id: StreamId) -> bool {
        self.highest.is_some_and(|highest| id <= highest)
    }
}

#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `id`. Fails unless `id` is above every identifier
    /// registered so far.
    pub fn register(&self, id: StreamId) -> Result<ResponseSlot, ProtocolViolation> {
        let mut table = self.table.lock();
        if table.was_registered(id) {
            drop(table);
            return Err(self.record(id, ViolationKind::DuplicateRegistration));
        }
        let (tx, rx) = oneshot::channel();
        table.awaiting.insert(id, tx);
        table.highest = Some(id);
        tracing::debug!(stream_id = %id, outstanding = table.awaiting.len(), "registered response slot");
        Ok(ResponseSlot { id, rx })
    }

    /// Settle the slot for `id` and drop it from the table.
    ///
    /// A second settlement, or one for an identifier that was never
    /// registered, is recorded and returned as a violation. The slot's first
    /// settlement is never overwritten.
    pub fn deliver(&self, id: StreamId, settlement: Settlement) -> Result<(), ProtocolViolation> {
        let mut table = self.table.lock();
        let kind = match table.awaiting.remove(&id) {
            Some(tx) => {
                drop(table);
                if tx.send(settlement).is_err() {
                    tracing::debug!(stream_id = %id, "settled after the gate stopped waiting");
                }
                return Ok(());
            }
            None if table.was_registered(id) => ViolationKind::DuplicateResolution,
            None => ViolationKind::UnknownStream,
        };
        drop(table);
        Err(self.record(id, kind))
    }

    fn record(&self, id: StreamId, kind: ViolationKind) -> ProtocolViolation {
        let violation = ProtocolViolation { id, kind };
        tracing::warn!(stream_id = %id, %kind, "protocol violation");
        self.violations.lock().push(violation.clone());
        violation
    }

    /// Registered identifiers still waiting for a settlement, sorted.
    pub fn pending_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.table.lock().awaiting.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Every violation recorded over the session so far.
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_ids())
            .field("violations", &self.violations.lock().len())
            .finish()
    }
}

/// Collect the response on stream `id` and settle its slot.
pub(crate) async fn receive(id: StreamId, response: ResponseFuture, correlator: Arc<Correlator>) {
    let settlement = collect(response).await.map_err(StreamFailure::from);
    match &settlement {
        Ok(response) => tracing::debug!(
            stream_id = %id,
            status = %response.status,
            body_len = response.body.len(),
            trailers = response.trailers.is_some(),
            "response received"
        ),
        Err(failure) => tracing::warn!(stream_id = %id, %failure, "stream failed"),
    }
    // A violation here is already recorded by the correlator.
    let _ = correlator.deliver(id, settlement);
}

async fn collect(response: ResponseFuture) -> Result<StreamResponse, h2::Error> {
    let (parts, mut body) = response.await?.into_parts();
    let mut data = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        body.flow_control().release_capacity(chunk.len())?;
        data.extend_from_slice(&chunk);
    }
    let trailers = body.trailers().await?;
    Ok(StreamResponse {
        status: parts.status,
        headers: parts.headers,
        body: data.freeze(),
        trailers,
    })
}
