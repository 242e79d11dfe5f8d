//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for an embedded
//! HTTP service. All types derive Serde traits for deserialization from
//! config files; every section has defaults so an empty file is a valid
//! configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::execution::RejectionPolicyKind;

/// Transport option key for the listen backlog.
pub const BACKLOG_OPTION: &str = "backlog";

/// Backlog applied when the transport options do not override it.
pub const DEFAULT_BACKLOG: u32 = 1000;

/// Root configuration for the HTTP service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Bind host, port and raw socket options.
    pub listener: ListenerConfig,

    /// Accept, I/O and execution pool sizing.
    pub threads: ThreadConfig,

    /// Request size limits.
    pub limits: LimitsConfig,

    /// Optional TLS termination.
    pub tls: Option<TlsConfig>,

    /// Log level and output format.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host name or address to bind.
    pub host: String,

    /// Port to bind; 0 asks the OS for an ephemeral port.
    pub port: u16,

    /// Raw socket options (`backlog`, `reuse_address`, `tcp_nodelay`,
    /// `keep_alive`, `recv_buffer_size`, `send_buffer_size`).
    pub transport_options: BTreeMap<String, String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        let mut transport_options = BTreeMap::new();
        transport_options.insert(BACKLOG_OPTION.to_string(), DEFAULT_BACKLOG.to_string());
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            transport_options,
        }
    }
}

/// Thread pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Threads accepting new connections.
    pub accept_threads: usize,

    /// Threads performing socket I/O and HTTP framing.
    pub io_threads: usize,

    /// Maximum threads running handler code. 0 runs handlers on I/O threads.
    pub exec_threads: usize,

    /// Seconds an idle execution thread is kept before it exits.
    pub exec_keep_alive_secs: u64,

    /// What to do with work the execution pool cannot admit.
    pub rejection_policy: RejectionPolicyKind,

    /// Upper bound on the estimated bytes queued for execution. 0 = unbounded.
    pub exec_max_pending_bytes: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            accept_threads: 1,
            io_threads: 10,
            exec_threads: 60,
            exec_keep_alive_secs: 60,
            rejection_policy: RejectionPolicyKind::CallerRuns,
            exec_max_pending_bytes: 0,
        }
    }
}

/// Request size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum aggregated body size for buffered handlers, in bytes.
    pub max_chunk_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 150 * 1024 * 1024,
        }
    }
}

/// TLS key material.
///
/// Both paths are optional at the schema level so a half-filled section is
/// reported by validation instead of failing deserialization.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file holding the certificate chain, leaf first.
    pub certificate: Option<PathBuf>,

    /// PEM file holding the private key.
    pub private_key: Option<PathBuf>,
}

impl TlsConfig {
    /// TLS material from a certificate chain and a private key file.
    pub fn new(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: Some(certificate.into()),
            private_key: Some(private_key.into()),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter directive when `RUST_LOG` is not set.
    pub level: String,

    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    #[default]
    Compact,
}
