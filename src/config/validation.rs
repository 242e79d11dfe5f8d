//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thread counts, body limits)
//! - Check transport options parse into socket settings
//! - Check TLS sections name both files
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - File contents (certificates, keys) are checked later by the TLS factory

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::ServiceConfig;
use crate::net::listener::SocketOptions;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener host must not be empty")]
    EmptyHost,

    #[error("threads.{field} must be at least 1")]
    NoThreads { field: &'static str },

    #[error("limits.max_chunk_size must be greater than 0")]
    ZeroChunkSize,

    #[error("transport option `{key}` has invalid value `{value}`")]
    InvalidTransportOption { key: String, value: String },

    #[error("unknown transport option `{0}`")]
    UnknownTransportOption(String),

    #[error("tls.{0} is required when TLS is enabled")]
    MissingTlsPath(&'static str),

    #[error("logging.level `{0}` is not a valid filter directive")]
    InvalidLogLevel(String),
}

/// Validate a configuration, collecting every error found.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }

    let options = SocketOptions::from_options(&config.listener.transport_options);
    if let Err(mut option_errors) = options {
        errors.append(&mut option_errors);
    }

    if config.threads.accept_threads == 0 {
        errors.push(ValidationError::NoThreads { field: "accept_threads" });
    }
    if config.threads.io_threads == 0 {
        errors.push(ValidationError::NoThreads { field: "io_threads" });
    }

    if config.limits.max_chunk_size == 0 {
        errors.push(ValidationError::ZeroChunkSize);
    }

    if let Some(tls) = &config.tls {
        if tls.certificate.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
            errors.push(ValidationError::MissingTlsPath("certificate"));
        }
        if tls.private_key.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
            errors.push(ValidationError::MissingTlsPath("private_key"));
        }
    }

    if EnvFilter::try_new(&config.logging.level).is_err() {
        errors.push(ValidationError::InvalidLogLevel(config.logging.level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServiceConfig::default()), Ok(()));
    }

    #[test]
    fn zero_exec_threads_is_allowed() {
        let mut config = ServiceConfig::default();
        config.threads.exec_threads = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ServiceConfig::default();
        config.listener.host = " ".into();
        config.threads.io_threads = 0;
        config.limits.max_chunk_size = 0;
        config.listener.transport_options.insert("backlog".into(), "lots".into());

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyHost));
        assert!(errors.contains(&ValidationError::NoThreads { field: "io_threads" }));
        assert!(errors.contains(&ValidationError::ZeroChunkSize));
        assert!(errors.contains(&ValidationError::InvalidTransportOption {
            key: "backlog".into(),
            value: "lots".into(),
        }));
    }

    #[test]
    fn tls_section_needs_both_paths() {
        let mut config = ServiceConfig::default();
        config.tls = Some(TlsConfig {
            certificate: Some("cert.pem".into()),
            private_key: None,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::MissingTlsPath("private_key")]);
    }

    #[test]
    fn unknown_transport_option_rejected() {
        let mut config = ServiceConfig::default();
        config.listener.transport_options.insert("so_linger".into(), "1".into());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::UnknownTransportOption("so_linger".into())]);
    }
}
