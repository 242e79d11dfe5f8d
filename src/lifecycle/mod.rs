//! Service lifecycle.
//!
//! # Data Flow
//! ```text
//! ServiceBuilder::build (service.rs):
//!     Validate config → TLS context → compile routes → assemble pipeline
//!
//! HttpService::start:
//!     Init handlers → bind → I/O runtime → accept runtime → accept loops
//!
//! HttpService::stop:
//!     Shutdown signal (shutdown.rs) → close connections (bounded wait)
//!     → destroy handlers → join executor → release runtimes
//! ```
//!
//! # Design Decisions
//! - Ordered startup: nothing binds until configuration is known good
//! - Ordered shutdown: stop accept, drain, close
//! - The only timeout is the connection close drain

pub mod service;
pub mod shutdown;

pub use service::{HttpService, ServiceBuilder, ServiceError, CLOSE_CONNECTIONS_TIMEOUT};
pub use shutdown::Shutdown;
