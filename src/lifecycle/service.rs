//! Service assembly, start and stop.
//!
//! # Responsibilities
//! - Validate configuration and compile routes before anything binds
//! - Own the accept runtime, the I/O runtime and the executor pool
//! - Stop in order: accept, connections, handlers, threads
//!
//! # Design Decisions
//! - Fail fast: every configuration fault surfaces from `build()` or `start()`
//! - Accept loops run on their own runtime; accepted sockets are handed to
//!   the I/O runtime so accepting never competes with request framing
//! - Closing connections and draining the executor share one
//!   `CLOSE_CONNECTIONS_TIMEOUT` deadline; a timeout is logged and shutdown
//!   carries on
//! - `start`/`stop` are blocking and must not be called from async code

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::{Builder, Runtime};

use crate::config::{validate_config, ConfigError, ServiceConfig, TlsConfig};
use crate::execution::{ExecutorPool, RejectionPolicy};
use crate::http::hooks::{HandlerHook, HookChain};
use crate::http::pipeline::{Pipeline, PipelineError, PipelineExtension};
use crate::http::server::{serve_connection, ServerShared};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::listener::{self, SocketOptions};
use crate::net::{ConnectionRegistry, TlsSessionFactory};
use crate::routing::{HandlerContext, HandlerRegistry, HttpHandler, PathRouter, RequestRouter};

/// Longest `stop()` waits for open connections and executor work to finish.
pub const CLOSE_CONNECTIONS_TIMEOUT: Duration = Duration::from_secs(5);

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from starting a service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service was already started")]
    AlreadyStarted,

    #[error("cannot resolve bind address: {0}")]
    Resolve(#[source] std::io::Error),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("handler initialization failed: {0:#}")]
    HandlerInit(#[source] anyhow::Error),
}

/// Collects configuration, handlers and hooks for one service.
pub struct ServiceBuilder {
    config: ServiceConfig,
    handlers: Vec<Arc<dyn HttpHandler>>,
    hooks: Vec<Arc<dyn HandlerHook>>,
    router: Option<Arc<dyn RequestRouter>>,
    pipeline: Option<PipelineExtension>,
    rejection_policy: Option<Arc<dyn RejectionPolicy>>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            hooks: Vec::new(),
            router: None,
            pipeline: None,
            rejection_policy: None,
        }
    }

    pub fn handler(mut self, handler: Arc<dyn HttpHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Append a hook; hooks run in the order they are added.
    pub fn hook(mut self, hook: Arc<dyn HandlerHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Replace the path router. Handler routes are then not compiled.
    pub fn router(mut self, router: Arc<dyn RequestRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Rearrange the pipeline once it is assembled.
    pub fn modify_pipeline<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Pipeline) -> Result<(), PipelineError> + Send + Sync + 'static,
    {
        self.pipeline = Some(Arc::new(f));
        self
    }

    /// Use a custom policy instead of the configured one.
    pub fn rejection_policy(mut self, policy: Arc<dyn RejectionPolicy>) -> Self {
        self.rejection_policy = Some(policy);
        self
    }

    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.listener.host = host.into();
        self.config.listener.port = port;
        self
    }

    pub fn exec_threads(mut self, threads: usize) -> Self {
        self.config.threads.exec_threads = threads;
        self
    }

    pub fn max_chunk_size(mut self, bytes: usize) -> Self {
        self.config.limits.max_chunk_size = bytes;
        self
    }

    pub fn tls(mut self, certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        self.config.tls = Some(TlsConfig::new(certificate, private_key));
        self
    }

    /// Validate everything and produce a stopped service.
    pub fn build(self) -> Result<HttpService, ConfigError> {
        validate_config(&self.config).map_err(ConfigError::Validation)?;
        let socket_options = SocketOptions::from_options(&self.config.listener.transport_options)
            .map_err(ConfigError::Validation)?;

        let tls = self.config.tls.as_ref().map(TlsSessionFactory::new).transpose()?;

        let config = Arc::new(self.config);
        let context = HandlerContext::new(Arc::clone(&config));
        let registry = HandlerRegistry::new(self.handlers, context);
        let router: Arc<dyn RequestRouter> = match self.router {
            Some(router) => router,
            None => {
                let routes = registry.routes().map_err(ConfigError::Routes)?;
                Arc::new(PathRouter::new(routes).map_err(ConfigError::Routes)?)
            }
        };

        let mut pipeline = Pipeline::standard(tls.is_some(), config.threads.exec_threads > 0);
        if let Some(extend) = &self.pipeline {
            extend(&mut pipeline)?;
        }
        tracing::debug!(stages = ?pipeline.stage_names(), "Pipeline assembled");

        let rejection_policy = self
            .rejection_policy
            .unwrap_or_else(|| config.threads.rejection_policy.build());

        Ok(HttpService {
            config,
            registry,
            router,
            hooks: HookChain::new(self.hooks),
            pipeline: Arc::new(pipeline),
            tls,
            socket_options,
            rejection_policy,
            state: State::Created,
        })
    }
}

enum State {
    Created,
    Running(Running),
    Stopped,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: Arc<Shutdown>,
    shared: Arc<ServerShared>,
    accept_runtime: Runtime,
    io_runtime: Runtime,
}

/// An embeddable HTTP service.
pub struct HttpService {
    config: Arc<ServiceConfig>,
    registry: HandlerRegistry,
    router: Arc<dyn RequestRouter>,
    hooks: HookChain,
    pipeline: Arc<Pipeline>,
    tls: Option<TlsSessionFactory>,
    socket_options: SocketOptions,
    rejection_policy: Arc<dyn RejectionPolicy>,
    state: State,
}

impl std::fmt::Debug for HttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("local_addr", &self.local_addr())
            .field("pipeline", &self.pipeline)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl HttpService {
    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Bound address, while the service runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> usize {
        match &self.state {
            State::Running(running) => running.shared.registry.len(),
            _ => 0,
        }
    }

    /// Initialize handlers, bind and start accepting.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        if !matches!(self.state, State::Created) {
            return Err(ServiceError::AlreadyStarted);
        }

        let listener_config = &self.config.listener;
        let addr = (listener_config.host.as_str(), listener_config.port)
            .to_socket_addrs()
            .map_err(ServiceError::Resolve)?
            .next()
            .ok_or_else(|| {
                ServiceError::Resolve(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}", listener_config.host),
                ))
            })?;

        self.registry.init_all().map_err(ServiceError::HandlerInit)?;
        match self.launch(addr) {
            Ok(running) => {
                tracing::info!(
                    address = %running.local_addr,
                    tls = self.tls.is_some(),
                    stages = ?self.pipeline.stage_names(),
                    "HTTP service started"
                );
                self.state = State::Running(running);
                Ok(())
            }
            Err(e) => {
                self.registry.destroy_all();
                Err(e)
            }
        }
    }

    fn launch(&self, addr: SocketAddr) -> Result<Running, ServiceError> {
        let threads = &self.config.threads;
        let std_listener =
            listener::bind(addr, &self.socket_options).map_err(|source| ServiceError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = std_listener.local_addr().map_err(ServiceError::Runtime)?;

        let io_runtime = Builder::new_multi_thread()
            .worker_threads(threads.io_threads)
            .thread_name("http-worker")
            .enable_all()
            .build()
            .map_err(ServiceError::Runtime)?;
        let accept_runtime = Builder::new_multi_thread()
            .worker_threads(threads.accept_threads)
            .thread_name("http-acceptor")
            .enable_all()
            .build()
            .map_err(ServiceError::Runtime)?;

        let pool = (threads.exec_threads > 0).then(|| {
            Arc::new(ExecutorPool::new(
                threads.exec_threads,
                Duration::from_secs(threads.exec_keep_alive_secs),
                threads.exec_max_pending_bytes,
                Arc::clone(&self.rejection_policy),
            ))
        });

        let shared = Arc::new(ServerShared {
            router: Arc::clone(&self.router),
            hooks: self.hooks.clone(),
            pipeline: Arc::clone(&self.pipeline),
            pool,
            max_chunk_size: self.config.limits.max_chunk_size,
            registry: Arc::new(ConnectionRegistry::new()),
            tls: self.tls.clone(),
            socket_options: self.socket_options.clone(),
            closing: AtomicBool::new(false),
        });

        let listener = {
            let _guard = accept_runtime.enter();
            Arc::new(TcpListener::from_std(std_listener).map_err(ServiceError::Runtime)?)
        };

        let shutdown = Arc::new(Shutdown::new());
        for _ in 0..threads.accept_threads {
            let mut stop = shutdown.subscribe();
            let shutdown = Arc::clone(&shutdown);
            let listener = Arc::clone(&listener);
            let shared = Arc::clone(&shared);
            let io = io_runtime.handle().clone();
            accept_runtime.spawn(async move {
                while !shutdown.is_triggered() {
                    let (stream, peer) = tokio::select! {
                        _ = stop.recv() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::warn!(error = %e, "Accept failed");
                                continue;
                            }
                        },
                    };
                    match stream.into_std() {
                        Ok(stream) => {
                            io.spawn(serve_connection(stream, peer, Arc::clone(&shared)));
                        }
                        Err(e) => tracing::warn!(%peer, error = %e, "Cannot hand over connection"),
                    }
                }
                tracing::debug!("Accept loop stopped");
            });
        }

        Ok(Running {
            local_addr,
            shutdown,
            shared,
            accept_runtime,
            io_runtime,
        })
    }

    /// Stop accepting, close connections, destroy handlers, release threads.
    ///
    /// Calling it again, or on a service never started, does nothing.
    pub fn stop(&mut self) {
        let State::Running(running) = std::mem::replace(&mut self.state, State::Stopped) else {
            return;
        };
        let Running {
            local_addr,
            shutdown,
            shared,
            accept_runtime,
            io_runtime,
        } = running;
        tracing::info!(address = %local_addr, "Stopping HTTP service");

        shutdown.trigger();
        accept_runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        shared.closing.store(true, Ordering::Release);
        let deadline = Instant::now() + CLOSE_CONNECTIONS_TIMEOUT;

        let registry = Arc::clone(&shared.registry);
        let closed = io_runtime.block_on(async move {
            let requested = registry.close_all();
            tracing::debug!(connections = requested, "Closing connections");
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::timeout(remaining, registry.wait_for_close()).await
        });
        if closed.is_err() {
            tracing::warn!(
                remaining = shared.registry.len(),
                "Timeout when closing all connections."
            );
        }

        self.registry.destroy_all();

        if let Some(pool) = &shared.pool {
            pool.shutdown(deadline.saturating_duration_since(Instant::now()));
        }
        io_runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        tracing::info!(address = %local_addr, "HTTP service stopped");
    }
}

impl Drop for HttpService {
    fn drop(&mut self) {
        if let State::Running(running) = std::mem::replace(&mut self.state, State::Stopped) {
            running.shutdown.trigger();
            running.shared.closing.store(true, Ordering::Release);
            running.shared.registry.close_all();
            self.registry.destroy_all();
            running.accept_runtime.shutdown_background();
            running.io_runtime.shutdown_background();
        }
    }
}
