//! Handler hooks and the responder that fires them.
//!
//! # Responsibilities
//! - Run pre-call hooks before a handler, letting any of them decline it
//! - Run post-call hooks exactly once after the terminal response
//! - Keep hook failures away from the request and from sibling hooks
//!
//! # Design Decisions
//! - The chain is an immutable `Arc` slice shared by every request
//! - For chunked responses the status announced at chunk start is reported,
//!   even when a later fault cuts the stream
//! - Hook panics are caught and logged like returned errors

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::http::invocation::panic_message;
use crate::http::request::{HttpRequest, RequestHead};
use crate::http::responder::HttpResponder;
use crate::routing::HandlerInfo;

/// Observes handler invocations.
pub trait HandlerHook: Send + Sync {
    /// Runs before the handler. Returning `false` skips the handler; the hook
    /// is then expected to have responded.
    fn pre_call(
        &self,
        _request: &HttpRequest,
        _responder: &mut dyn HttpResponder,
        _info: &HandlerInfo,
    ) -> bool {
        true
    }

    /// Runs once after the response for the request was sent.
    fn post_call(
        &self,
        _request: &RequestHead,
        _status: StatusCode,
        _info: &HandlerInfo,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered, immutable list of hooks.
#[derive(Clone)]
pub struct HookChain {
    hooks: Arc<[Arc<dyn HandlerHook>]>,
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain").field("len", &self.hooks.len()).finish()
    }
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn HandlerHook>>) -> Self {
        Self { hooks: hooks.into() }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every pre-call hook in order. Stops at the first `false`.
    pub fn pre_call(
        &self,
        request: &HttpRequest,
        responder: &mut dyn HttpResponder,
        info: &HandlerInfo,
    ) -> bool {
        for (index, hook) in self.hooks.iter().enumerate() {
            let call = AssertUnwindSafe(|| hook.pre_call(request, responder, info));
            let proceed = match panic::catch_unwind(call) {
                Ok(proceed) => proceed,
                Err(payload) => {
                    tracing::error!(
                        hook = index,
                        handler = %info,
                        panic = %panic_message(payload.as_ref()),
                        "Pre-call hook panicked"
                    );
                    true
                }
            };
            if !proceed {
                tracing::debug!(hook = index, handler = %info, "Pre-call hook declined request");
                return false;
            }
        }
        true
    }

    /// Run every post-call hook in order, isolating failures.
    pub fn post_call(&self, request: &RequestHead, status: StatusCode, info: &HandlerInfo) {
        for (index, hook) in self.hooks.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| hook.post_call(request, status, info))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        hook = index,
                        handler = %info,
                        error = %e,
                        "Post-call hook failed"
                    );
                }
                Err(payload) => {
                    tracing::error!(
                        hook = index,
                        handler = %info,
                        panic = %panic_message(payload.as_ref()),
                        "Post-call hook panicked"
                    );
                }
            }
        }
    }
}

/// Responder that runs the post-call hooks after the terminal response.
pub struct HookResponder<R> {
    inner: R,
    hooks: HookChain,
    request: RequestHead,
    info: Arc<HandlerInfo>,
    chunk_status: Option<StatusCode>,
    fired: bool,
}

impl<R: HttpResponder> HookResponder<R> {
    pub fn new(inner: R, hooks: HookChain, request: RequestHead, info: Arc<HandlerInfo>) -> Self {
        Self {
            inner,
            hooks,
            request,
            info,
            chunk_status: None,
            fired: false,
        }
    }

    /// Whether the post-call hooks already ran.
    pub fn hooks_fired(&self) -> bool {
        self.fired
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn complete(&mut self, status: StatusCode) {
        let status = self.chunk_status.take().unwrap_or(status);
        if std::mem::replace(&mut self.fired, true) {
            return;
        }
        self.hooks.post_call(&self.request, status, &self.info);
    }
}

impl<R: HttpResponder> HttpResponder for HookResponder<R> {
    fn send_status(&mut self, status: StatusCode, headers: HeaderMap) {
        self.inner.send_status(status, headers);
        self.complete(status);
    }

    fn send_content(
        &mut self,
        status: StatusCode,
        content: Bytes,
        content_type: &str,
        headers: HeaderMap,
    ) {
        self.inner.send_content(status, content, content_type, headers);
        self.complete(status);
    }

    fn send_error(&mut self, status: StatusCode, message: &str) {
        self.inner.send_error(status, message);
        self.complete(status);
    }

    fn send_file(&mut self, path: &Path, headers: HeaderMap) -> StatusCode {
        let status = self.inner.send_file(path, headers);
        self.complete(status);
        status
    }

    fn send_chunk_start(&mut self, status: StatusCode, headers: HeaderMap) {
        self.inner.send_chunk_start(status, headers);
        if !self.fired && self.chunk_status.is_none() {
            self.chunk_status = Some(status);
        }
    }

    fn send_chunk(&mut self, content: Bytes) {
        self.inner.send_chunk(content);
    }

    fn send_chunk_end(&mut self) {
        self.inner.send_chunk_end();
        if let Some(status) = self.chunk_status {
            self.complete(status);
        }
    }
}
