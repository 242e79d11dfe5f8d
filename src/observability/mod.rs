//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (structured, with connection and request IDs)
//!     → metrics.rs (counters, gauges via the metrics facade)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout), or the embedder's own subscriber
//!     → whatever metrics recorder the embedder installs
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through the request span
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
