//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (hyper HTTP/1.1, compression, connection close)
//!     → pipeline.rs (custom stages see the request head)
//!     → routing (handler method + args)
//!     → request.rs (aggregated or streamed request view)
//!     → execution lane → dispatcher.rs (head / chunk / abort events)
//!     → invocation.rs (pre-call hooks, handler, body consumer)
//!     → hooks.rs (post-call hooks on the terminal response)
//!     → responder.rs (response head + body back to the connection)
//!     → pipeline.rs (custom stages see the response head)
//! ```

pub mod consumer;
pub mod dispatcher;
pub mod hooks;
pub mod invocation;
pub mod pipeline;
pub mod request;
pub mod responder;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use consumer::BodyConsumer;
pub use dispatcher::{Dispatcher, TransportEvent};
pub use hooks::{HandlerHook, HookChain, HookResponder};
pub use invocation::{HaltSignal, InvocationError, InvocationState};
pub use pipeline::{Pipeline, PipelineError, PipelineExtension, PipelineStage};
pub use request::{HttpRequest, RequestHead, RequestId};
pub use responder::{ChannelResponder, HttpResponder, HttpResponderExt, ResponseBody, ResponseHead};
pub use server::INLINE_BODY_LIMIT;
