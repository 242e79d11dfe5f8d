//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route Compilation (at build):
//!     HttpHandler::register(&mut Routes)
//!     → handler.rs (templates, declared parameters, method shape)
//!     → matcher.rs (compile templates)
//!     → router.rs (freeze as immutable PathRouter)
//!
//! Incoming Request (method, path)
//!     → router.rs (template scan, specificity ranking)
//!     → Return: Matched(handler, args) | MethodNotAllowed | NotFound
//!
//! Lifecycle:
//!     registry.rs → init at start, destroy at stop
//! ```
//!
//! # Design Decisions
//! - Routes compiled at build, immutable at runtime
//! - No regex in hot path (segment comparison only)
//! - Deterministic: same input always matches same route
//! - Most specific template wins, first registered breaks ties

pub mod handler;
pub mod matcher;
pub mod registry;
pub mod router;

use thiserror::Error;

pub use handler::{
    Args, BufferedFn, HandlerContext, HandlerInfo, HandlerMethod, HttpHandler, Route, RouteSpec,
    Routes, StreamingFn,
};
pub use matcher::PathTemplate;
pub use registry::HandlerRegistry;
pub use router::{FixedRouter, PathRouter, RequestRouter, ResolvedRoute, RouteOutcome};

/// A route declaration that cannot be served.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("invalid path template `{template}`: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("route `{route}` declares parameter `{param}` missing from its path")]
    UnknownParam { route: String, param: String },

    #[error("route {method} `{template}` is registered twice")]
    Duplicate { method: http::Method, template: String },
}
