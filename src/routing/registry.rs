//! Handler lifecycle.
//!
//! Every handler is initialized once when the service starts and destroyed
//! once when it stops, against one shared `HandlerContext`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::routing::handler::{HandlerContext, HttpHandler, Route, Routes};
use crate::routing::RouteError;

/// The handler set of one service.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn HttpHandler>>,
    context: HandlerContext,
    initialized: AtomicBool,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn HttpHandler>>, context: HandlerContext) -> Self {
        Self {
            handlers,
            context,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Collect every handler's routes, reporting all declaration errors.
    pub fn routes(&self) -> Result<Vec<Route>, Vec<RouteError>> {
        let mut collected = Vec::new();
        let mut errors = Vec::new();
        for handler in &self.handlers {
            let mut routes = Routes::new(handler.base_path(), handler.name());
            Arc::clone(handler).register(&mut routes);
            match routes.into_routes() {
                Ok(mut routes) => collected.append(&mut routes),
                Err(mut e) => errors.append(&mut e),
            }
        }
        if errors.is_empty() {
            Ok(collected)
        } else {
            Err(errors)
        }
    }

    /// Initialize every handler. Stops at the first failure, destroying the
    /// handlers already initialized.
    pub fn init_all(&self) -> anyhow::Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for (index, handler) in self.handlers.iter().enumerate() {
            if let Err(e) = handler.init(&self.context) {
                tracing::error!(
                    handler = handler.name(),
                    error = %e,
                    "Handler initialization failed"
                );
                for started in self.handlers[..index].iter().rev() {
                    started.destroy(&self.context);
                }
                self.initialized.store(false, Ordering::Release);
                return Err(e.context(format!("initializing handler {}", handler.name())));
            }
            tracing::debug!(handler = handler.name(), "Handler initialized");
        }
        Ok(())
    }

    /// Destroy every initialized handler, in reverse registration order.
    pub fn destroy_all(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        for handler in self.handlers.iter().rev() {
            handler.destroy(&self.context);
            tracing::debug!(handler = handler.name(), "Handler destroyed");
        }
    }
}
