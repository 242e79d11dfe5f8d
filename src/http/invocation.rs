//! Per-request invocation state.
//!
//! # Responsibilities
//! - Invoke the resolved handler method exactly once
//! - Own the streaming body consumer and feed it fragments in order
//! - Translate handler and consumer failures into a 500 response
//! - Make sure a consumer always ends through `finished` or `handle_error`
//!
//! # Design Decisions
//! - The consumer lives inside the `Streaming` phase; leaving that phase
//!   drops it, so a stale consumer cannot be reached
//! - The outward error message is the innermost cause of the error chain
//! - Handler panics are caught and treated like returned errors
//! - Once the state leaves `Created`/`Streaming` the responder is released,
//!   so a handler that never answered resolves to a 500 immediately

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

use crate::http::consumer::BodyConsumer;
use crate::http::hooks::HookChain;
use crate::http::request::HttpRequest;
use crate::http::responder::HttpResponder;
use crate::observability::metrics;
use crate::routing::{Args, HandlerInfo, HandlerMethod, ResolvedRoute};

/// Prefix of every handler failure response body.
pub const FAULT_MESSAGE_PREFIX: &str = "Exception Encountered while processing request : ";

/// Errors reported by the invocation state.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The handler or consumer failed; a 500 was already sent.
    #[error("handler fault: {0}")]
    Fault(String),

    #[error("handler already invoked")]
    AlreadyInvoked,

    /// A body fragment arrived with no consumer to take it.
    #[error("body fragment received without a consumer")]
    MissingConsumer,
}

/// Set once the request stopped accepting body fragments.
#[derive(Debug, Clone, Default)]
pub struct HaltSignal(Arc<AtomicBool>);

impl HaltSignal {
    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn halt(&self) {
        self.0.store(true, Ordering::Release);
    }
}

enum Phase {
    Created,
    Streaming(Box<dyn BodyConsumer>),
    Completed,
    Faulted,
    Declined,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Streaming(_) => "streaming",
            Phase::Completed => "completed",
            Phase::Faulted => "faulted",
            Phase::Declined => "declined",
        }
    }
}

/// Everything needed to serve one request.
pub struct InvocationState {
    info: Arc<HandlerInfo>,
    method: HandlerMethod,
    args: Args,
    hooks: HookChain,
    request: Option<HttpRequest>,
    responder: Option<Box<dyn HttpResponder>>,
    phase: Phase,
    chunked: bool,
    halt: HaltSignal,
}

impl std::fmt::Debug for InvocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationState")
            .field("handler", &self.info.to_string())
            .field("phase", &self.phase.name())
            .field("chunked", &self.chunked)
            .finish()
    }
}

impl InvocationState {
    pub fn new(
        route: ResolvedRoute,
        request: HttpRequest,
        responder: Box<dyn HttpResponder>,
        hooks: HookChain,
    ) -> Self {
        let chunked = request.is_chunked();
        Self {
            info: route.info,
            method: route.handler,
            args: route.args,
            hooks,
            request: Some(request),
            responder: Some(responder),
            phase: Phase::Created,
            chunked,
            halt: HaltSignal::default(),
        }
    }

    pub fn info(&self) -> &HandlerInfo {
        &self.info
    }

    /// Bytes of body still held for the handler.
    pub fn body_len(&self) -> usize {
        self.request.as_ref().map_or(0, |r| r.body().len())
    }

    /// Signal observed by the body reader to stop early.
    pub fn halt_signal(&self) -> HaltSignal {
        self.halt.clone()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Streaming(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.phase, Phase::Completed)
    }

    /// Faulted or declined: remaining body fragments are ignored.
    pub fn is_halted(&self) -> bool {
        matches!(self.phase, Phase::Faulted | Phase::Declined)
    }

    /// Run the pre-call hooks and the handler method.
    pub fn invoke(&mut self) -> Result<(), InvocationError> {
        if !matches!(self.phase, Phase::Created) {
            return Err(InvocationError::AlreadyInvoked);
        }
        let (Some(mut request), Some(responder)) =
            (self.request.take(), self.responder.as_deref_mut())
        else {
            return Err(InvocationError::AlreadyInvoked);
        };

        if !self.hooks.pre_call(&request, responder, &self.info) {
            self.finish_phase(Phase::Declined);
            return Ok(());
        }

        match self.method.clone() {
            HandlerMethod::Buffered(method) => {
                match guarded(|| method(&mut request, responder, &self.args)) {
                    Ok(()) => {
                        self.finish_phase(Phase::Completed);
                        Ok(())
                    }
                    Err(e) => Err(self.fault(e)),
                }
            }
            HandlerMethod::Streaming(method) => {
                let withheld = request.detach_body();
                let consumer = match guarded(|| method(&mut request, responder, &self.args)) {
                    Ok(consumer) => consumer,
                    Err(e) => return Err(self.fault(e)),
                };
                self.phase = Phase::Streaming(consumer);
                if !withheld.is_empty() {
                    self.deliver(withheld)?;
                }
                if !self.chunked {
                    self.finish_stream()?;
                }
                Ok(())
            }
        }
    }

    /// Deliver one body fragment; `last` ends the body after `data`.
    pub fn chunk(&mut self, data: Bytes, last: bool) -> Result<(), InvocationError> {
        match self.phase {
            Phase::Streaming(_) => {}
            Phase::Faulted | Phase::Declined => return Ok(()),
            Phase::Created | Phase::Completed => return Err(InvocationError::MissingConsumer),
        }
        if !data.is_empty() {
            self.deliver(data)?;
        }
        if last {
            self.finish_stream()?;
        }
        Ok(())
    }

    /// The connection failed mid-body. Ends the consumer without responding.
    pub fn abort(&mut self, cause: anyhow::Error) {
        if !self.is_streaming() {
            return;
        }
        if let Phase::Streaming(consumer) = std::mem::replace(&mut self.phase, Phase::Faulted) {
            tracing::debug!(handler = %self.info, error = %cause, "Request body aborted");
            end_consumer(consumer, &cause);
        }
        self.finish_phase(Phase::Faulted);
    }

    fn deliver(&mut self, data: Bytes) -> Result<(), InvocationError> {
        let Phase::Streaming(consumer) = &mut self.phase else {
            return Err(InvocationError::MissingConsumer);
        };
        let Some(responder) = self.responder.as_deref_mut() else {
            return Err(InvocationError::MissingConsumer);
        };
        match guarded(|| consumer.chunk(data, responder)) {
            Ok(()) => Ok(()),
            Err(e) => {
                let phase = std::mem::replace(&mut self.phase, Phase::Faulted);
                if let Phase::Streaming(consumer) = phase {
                    end_consumer(consumer, &e);
                }
                Err(self.fault(e))
            }
        }
    }

    fn finish_stream(&mut self) -> Result<(), InvocationError> {
        let Phase::Streaming(consumer) = std::mem::replace(&mut self.phase, Phase::Completed) else {
            return Err(InvocationError::MissingConsumer);
        };
        let Some(responder) = self.responder.as_deref_mut() else {
            return Err(InvocationError::MissingConsumer);
        };
        match guarded(|| consumer.finished(responder)) {
            Ok(()) => {
                self.finish_phase(Phase::Completed);
                Ok(())
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    fn finish_phase(&mut self, phase: Phase) {
        if matches!(phase, Phase::Faulted | Phase::Declined) {
            self.halt.halt();
        }
        self.phase = phase;
        self.responder = None;
    }

    fn fault(&mut self, error: anyhow::Error) -> InvocationError {
        let message = error.root_cause().to_string();
        tracing::warn!(handler = %self.info, error = %message, "Handler fault");
        metrics::record_handler_fault();
        if let Some(responder) = self.responder.as_deref_mut() {
            responder.send_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("{FAULT_MESSAGE_PREFIX}{message}"),
            );
        }
        self.finish_phase(Phase::Faulted);
        InvocationError::Fault(message)
    }
}

impl Drop for InvocationState {
    fn drop(&mut self) {
        if let Phase::Streaming(consumer) = std::mem::replace(&mut self.phase, Phase::Faulted) {
            tracing::debug!(handler = %self.info, "Request abandoned before the body completed");
            end_consumer(consumer, &anyhow::anyhow!("request abandoned before the body completed"));
        }
    }
}

fn end_consumer(consumer: Box<dyn BodyConsumer>, cause: &anyhow::Error) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| consumer.handle_error(cause))) {
        tracing::error!(
            panic = %panic_message(payload.as_ref()),
            "Body consumer panicked in handle_error"
        );
    }
}

/// Run handler code, turning a panic into an error carrying its message.
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(panic_message(payload.as_ref()))),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
