//! Streaming body consumer contract.
//!
//! A streaming handler returns a `BodyConsumer`. The request body is then fed
//! to it fragment by fragment, in arrival order, never concurrently. Exactly
//! one of `finished` or `handle_error` ends its life; both take the consumer
//! by value so it cannot be used afterwards.

use bytes::Bytes;

use crate::http::responder::HttpResponder;

/// Receives the body of a streamed request.
pub trait BodyConsumer: Send {
    /// One body fragment. An error answers the request with a 500 and
    /// `handle_error` is called next.
    fn chunk(&mut self, fragment: Bytes, responder: &mut dyn HttpResponder) -> anyhow::Result<()>;

    /// The whole body was delivered. The consumer should respond here.
    fn finished(self: Box<Self>, responder: &mut dyn HttpResponder) -> anyhow::Result<()>;

    /// Delivery stopped early: a fragment failed, the connection closed, or
    /// the request was abandoned. No response can be sent from here.
    fn handle_error(self: Box<Self>, cause: &anyhow::Error);
}
