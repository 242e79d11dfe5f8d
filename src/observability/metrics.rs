//! Metrics collection.
//!
//! # Metrics
//! - `http_requests_total` (counter): responses by status
//! - `http_active_connections` (gauge): current connection count
//! - `http_handler_faults_total` (counter): handler and consumer failures
//! - `http_executor_rejections_total` (counter): pool rejections by policy
//!
//! # Design Decisions
//! - Only the `metrics` facade is used; the embedding application installs
//!   whichever recorder/exporter it wants
//! - Without a recorder every call is a no-op

use http::StatusCode;

/// Count one response.
pub fn record_response(status: StatusCode) {
    metrics::counter!("http_requests_total", "status" => status.as_u16().to_string()).increment(1);
}

/// A connection was accepted.
pub fn connection_opened() {
    metrics::gauge!("http_active_connections").increment(1.0);
}

/// A connection was closed.
pub fn connection_closed() {
    metrics::gauge!("http_active_connections").decrement(1.0);
}

/// A handler or body consumer failed.
pub fn record_handler_fault() {
    metrics::counter!("http_handler_faults_total").increment(1);
}

/// The execution pool refused a task.
pub fn record_rejection(policy: &'static str) {
    metrics::counter!("http_executor_rejections_total", "policy" => policy).increment(1);
}
