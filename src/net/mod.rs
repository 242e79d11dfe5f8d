//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerConfig
//!     → listener.rs (socket options, backlog, bind)
//!     → accept loop (lifecycle::service) on the accept runtime
//!     → connection.rs (registered before any handshake)
//!     → tls.rs (optional server-mode session per connection)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently
//! - Key material is validated when the service is built, not on first use

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionCloser, ConnectionGuard, ConnectionId, ConnectionRegistry};
pub use listener::SocketOptions;
pub use tls::{TlsError, TlsSessionFactory};
