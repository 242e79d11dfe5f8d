//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) or ServiceConfig built in code
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated, immutable)
//!     → ServiceBuilder::build() (TLS material, routes, pipeline)
//!     → shared via Arc with handlers through HandlerContext
//! ```
//!
//! # Design Decisions
//! - Config is immutable once a service is built
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ListenerConfig, LimitsConfig, LogFormat, LoggingConfig, ServiceConfig, ThreadConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
