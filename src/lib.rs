//! Embeddable HTTP/1.1 service core.
//!
//! Accepts connections on a dedicated accept runtime, frames HTTP/1.1 (and
//! optionally TLS) on an I/O runtime, and runs application handlers on a
//! memory-aware execution pool. Handlers either receive the whole body or
//! return a `BodyConsumer` fed the body fragment by fragment. Post-call hooks
//! observe every terminal response exactly once.

pub mod config;
pub mod execution;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;

pub use config::ServiceConfig;
pub use crate::http::{
    BodyConsumer, HandlerHook, HttpRequest, HttpResponder, HttpResponderExt, RequestHead,
};
pub use lifecycle::{HttpService, ServiceBuilder, ServiceError};
pub use routing::{Args, HandlerContext, HandlerInfo, HttpHandler, Routes};
