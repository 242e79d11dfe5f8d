//! Transport-event dispatcher.
//!
//! Delivers the decoded events of one connection to the invocation state
//! attached to it. The attachment slot belongs to the connection's execution
//! lane; the dispatcher itself holds nothing.

use bytes::Bytes;

use crate::http::invocation::{InvocationError, InvocationState};

/// Fixed overhead charged for each event when estimating its memory cost.
const HEAD_OVERHEAD: usize = 512;
const CHUNK_OVERHEAD: usize = 64;

/// A decoded inbound event.
#[derive(Debug)]
pub enum TransportEvent {
    /// A new request, already routed.
    Head(InvocationState),
    /// A body fragment of the current request.
    Chunk { data: Bytes, last: bool },
    /// The transport failed while the body was still arriving.
    Abort(anyhow::Error),
}

impl TransportEvent {
    /// Rough bytes held while the event waits for execution.
    pub fn estimated_cost(&self) -> usize {
        match self {
            TransportEvent::Head(state) => state.body_len() + HEAD_OVERHEAD,
            TransportEvent::Chunk { data, .. } => data.len() + CHUNK_OVERHEAD,
            TransportEvent::Abort(_) => CHUNK_OVERHEAD,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Head(_) => "head",
            TransportEvent::Chunk { .. } => "chunk",
            TransportEvent::Abort(_) => "abort",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Dispatcher;

impl Dispatcher {
    /// Deliver `event` to the state in `slot`.
    ///
    /// A head replaces the attachment and invokes it. A completed or aborted
    /// state is detached; a faulted or declined one stays attached so the
    /// rest of its body is swallowed.
    pub fn dispatch(
        &self,
        slot: &mut Option<InvocationState>,
        event: TransportEvent,
    ) -> Result<(), InvocationError> {
        let aborted = matches!(event, TransportEvent::Abort(_));
        let result = match event {
            TransportEvent::Head(state) => slot.insert(state).invoke(),
            TransportEvent::Chunk { data, last } => match slot.as_mut() {
                Some(state) => state.chunk(data, last),
                None => Err(InvocationError::MissingConsumer),
            },
            TransportEvent::Abort(cause) => {
                if let Some(state) = slot.as_mut() {
                    state.abort(cause);
                }
                Ok(())
            }
        };

        if aborted || slot.as_ref().is_some_and(InvocationState::is_completed) {
            *slot = None;
        }
        result
    }
}
