//! TCP listener binding with caller-supplied socket options.
//!
//! # Responsibilities
//! - Parse the transport options map into typed socket settings
//! - Bind the listening socket with the configured backlog
//! - Apply per-connection options to accepted streams
//!
//! # Design Decisions
//! - The socket is built with socket2 so backlog and buffer sizes are honored
//!   before `listen()`; tokio's `TcpListener::bind` offers neither
//! - The bound listener is returned as a std listener so the caller decides
//!   which runtime it is registered with

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::schema::{BACKLOG_OPTION, DEFAULT_BACKLOG};
use crate::config::validation::ValidationError;

/// Socket settings derived from the transport options map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Pending connection queue length passed to `listen()`.
    pub backlog: u32,
    /// SO_REUSEADDR on the listening socket.
    pub reuse_address: bool,
    /// TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// SO_KEEPALIVE on accepted connections.
    pub keep_alive: bool,
    /// SO_RCVBUF on the listening socket (inherited by accepted sockets).
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF on the listening socket (inherited by accepted sockets).
    pub send_buffer_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            reuse_address: true,
            tcp_nodelay: true,
            keep_alive: false,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl SocketOptions {
    /// Parse a transport options map. Every bad entry is reported.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, Vec<ValidationError>> {
        let mut parsed = Self::default();
        let mut errors = Vec::new();

        for (key, value) in options {
            let result = match key.as_str() {
                BACKLOG_OPTION => parse_into(value, &mut parsed.backlog),
                "reuse_address" => parse_into(value, &mut parsed.reuse_address),
                "tcp_nodelay" => parse_into(value, &mut parsed.tcp_nodelay),
                "keep_alive" => parse_into(value, &mut parsed.keep_alive),
                "recv_buffer_size" => parse_some(value, &mut parsed.recv_buffer_size),
                "send_buffer_size" => parse_some(value, &mut parsed.send_buffer_size),
                _ => {
                    errors.push(ValidationError::UnknownTransportOption(key.clone()));
                    continue;
                }
            };
            if result.is_err() {
                errors.push(ValidationError::InvalidTransportOption {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        if errors.is_empty() {
            Ok(parsed)
        } else {
            Err(errors)
        }
    }

    /// Apply per-connection options to an accepted stream.
    pub fn apply_to_stream(&self, stream: &tokio::net::TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.tcp_nodelay)?;
        if self.keep_alive {
            SockRef::from(stream).set_keepalive(true)?;
        }
        Ok(())
    }
}

fn parse_into<T: FromStr>(value: &str, slot: &mut T) -> Result<(), ()> {
    *slot = value.trim().parse().map_err(|_| ())?;
    Ok(())
}

fn parse_some<T: FromStr>(value: &str, slot: &mut Option<T>) -> Result<(), ()> {
    *slot = Some(value.trim().parse().map_err(|_| ())?);
    Ok(())
}

/// Bind a non-blocking listening socket.
pub fn bind(addr: SocketAddr, options: &SocketOptions) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if options.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let backlog = i32::try_from(options.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog)?;

    let listener: std::net::TcpListener = socket.into();
    tracing::debug!(address = %addr, backlog, "Listening socket bound");
    Ok(listener)
}
