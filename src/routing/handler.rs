//! Handler registration.
//!
//! # Responsibilities
//! - Define the `HttpHandler` contract applications implement
//! - Collect routes through the `Routes` builder
//! - Bind path parameters to a handler's declared argument order
//!
//! # Design Decisions
//! - A route is a closure over the handler `Arc`; no reflection, no macros
//! - Buffered and streaming methods are distinct variants, chosen at
//!   registration time
//! - Parameter declarations are checked against the template when the
//!   service is built, never per request

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context as _;
use http::Method;

use crate::config::ServiceConfig;
use crate::http::consumer::BodyConsumer;
use crate::http::request::HttpRequest;
use crate::http::responder::HttpResponder;
use crate::routing::matcher::PathTemplate;
use crate::routing::RouteError;

/// Handler method receiving the whole body.
pub type BufferedFn =
    dyn Fn(&mut HttpRequest, &mut dyn HttpResponder, &Args) -> anyhow::Result<()> + Send + Sync;

/// Handler method returning a consumer for the body.
pub type StreamingFn = dyn Fn(
        &mut HttpRequest,
        &mut dyn HttpResponder,
        &Args,
    ) -> anyhow::Result<Box<dyn BodyConsumer>>
    + Send
    + Sync;

/// The two shapes a handler method can take.
#[derive(Clone)]
pub enum HandlerMethod {
    Buffered(Arc<BufferedFn>),
    Streaming(Arc<StreamingFn>),
}

impl HandlerMethod {
    pub fn is_streaming(&self) -> bool {
        matches!(self, HandlerMethod::Streaming(_))
    }
}

impl std::fmt::Debug for HandlerMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerMethod::Buffered(_) => f.write_str("Buffered"),
            HandlerMethod::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Names the handler and method serving a request, for hooks and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    handler: String,
    method: String,
}

impl HandlerInfo {
    pub fn new(handler: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            method: method.into(),
        }
    }

    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    pub fn method_name(&self) -> &str {
        &self.method
    }
}

impl std::fmt::Display for HandlerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.handler, self.method)
    }
}

/// Path parameter values in the order the route declared them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    names: Arc<[String]>,
    values: Vec<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self::new(Vec::new().into(), Vec::new())
    }
}

impl Args {
    pub fn new(names: Arc<[String]>, values: Vec<String>) -> Self {
        Self { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`.
    pub fn raw(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    /// Value at `index` converted to `T`.
    pub fn get<T>(&self, index: usize) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let raw = self
            .raw(index)
            .with_context(|| format!("no argument at position {index}"))?;
        let name = self.names.get(index).map_or("?", String::as_str);
        raw.parse::<T>()
            .with_context(|| format!("cannot convert argument `{name}` from `{raw}`"))
    }

    /// Raw value of the parameter called `name`.
    pub fn named(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|index| self.raw(index))
    }
}

/// Shared state handed to handlers at init and destroy.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    config: Arc<ServiceConfig>,
}

impl HandlerContext {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        Self { config }
    }

    /// Configuration the service was built with.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

/// Application request handler.
pub trait HttpHandler: Send + Sync + 'static {
    /// Prefix applied to every route this handler registers.
    fn base_path(&self) -> &str {
        ""
    }

    /// Name used in logs and hook notifications.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Declare the handler's routes.
    fn register(self: Arc<Self>, routes: &mut Routes);

    /// Called once when the service starts.
    fn init(&self, _context: &HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the service stops.
    fn destroy(&self, _context: &HandlerContext) {}
}

/// One registered route.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub template: PathTemplate,
    pub params: Arc<[String]>,
    pub info: Arc<HandlerInfo>,
    pub handler: HandlerMethod,
}

/// Collects the routes of one handler.
#[derive(Debug)]
pub struct Routes {
    base: String,
    handler_name: String,
    routes: Vec<Route>,
    errors: Vec<RouteError>,
}

impl Routes {
    pub fn new(base: &str, handler_name: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            handler_name: handler_name.to_string(),
            routes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&mut self, path: &str, name: &str) -> RouteSpec<'_> {
        self.route(Method::GET, path, name)
    }

    pub fn put(&mut self, path: &str, name: &str) -> RouteSpec<'_> {
        self.route(Method::PUT, path, name)
    }

    pub fn post(&mut self, path: &str, name: &str) -> RouteSpec<'_> {
        self.route(Method::POST, path, name)
    }

    pub fn delete(&mut self, path: &str, name: &str) -> RouteSpec<'_> {
        self.route(Method::DELETE, path, name)
    }

    pub fn head(&mut self, path: &str, name: &str) -> RouteSpec<'_> {
        self.route(Method::HEAD, path, name)
    }

    /// Start declaring a route for `method` at `path` (relative to the base).
    pub fn route(&mut self, method: Method, path: &str, name: &str) -> RouteSpec<'_> {
        let path = if path.starts_with('/') || path.is_empty() {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        };
        RouteSpec {
            routes: self,
            method,
            path,
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    /// Finish collection, returning the routes or every declaration error.
    pub fn into_routes(self) -> Result<Vec<Route>, Vec<RouteError>> {
        if self.errors.is_empty() {
            Ok(self.routes)
        } else {
            Err(self.errors)
        }
    }

    fn push(
        &mut self,
        spec_method: Method,
        path: String,
        name: String,
        params: Vec<String>,
        handler: HandlerMethod,
    ) {
        let template = match PathTemplate::parse(&path) {
            Ok(template) => template,
            Err(e) => {
                self.errors.push(e);
                return;
            }
        };
        for param in &params {
            if !template.params().any(|p| p == param) {
                self.errors.push(RouteError::UnknownParam {
                    route: format!("{} {}", spec_method, path),
                    param: param.clone(),
                });
            }
        }
        self.routes.push(Route {
            method: spec_method,
            template,
            params: params.into(),
            info: Arc::new(HandlerInfo::new(self.handler_name.clone(), name)),
            handler,
        });
    }
}

/// Builder for a single route.
pub struct RouteSpec<'a> {
    routes: &'a mut Routes,
    method: Method,
    path: String,
    name: String,
    params: Vec<String>,
}

impl RouteSpec<'_> {
    /// Declare the next handler argument as the path parameter `name`.
    pub fn param(mut self, name: &str) -> Self {
        self.params.push(name.to_string());
        self
    }

    /// Register a method that receives the aggregated body.
    pub fn buffered<F>(self, f: F)
    where
        F: Fn(&mut HttpRequest, &mut dyn HttpResponder, &Args) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let handler = HandlerMethod::Buffered(Arc::new(f));
        self.routes.push(self.method, self.path, self.name, self.params, handler);
    }

    /// Register a method that returns a consumer for the body.
    pub fn streaming<F, C>(self, f: F)
    where
        F: Fn(&mut HttpRequest, &mut dyn HttpResponder, &Args) -> anyhow::Result<C>
            + Send
            + Sync
            + 'static,
        C: BodyConsumer + 'static,
    {
        let handler = HandlerMethod::Streaming(boxed_streaming(f));
        self.routes.push(self.method, self.path, self.name, self.params, handler);
    }
}

fn boxed_streaming<F, C>(f: F) -> Arc<StreamingFn>
where
    F: Fn(&mut HttpRequest, &mut dyn HttpResponder, &Args) -> anyhow::Result<C>
        + Send
        + Sync
        + 'static,
    C: BodyConsumer + 'static,
{
    Arc::new(move |request: &mut HttpRequest, responder: &mut dyn HttpResponder, args: &Args| {
        f(request, responder, args).map(|consumer| Box::new(consumer) as Box<dyn BodyConsumer>)
    })
}
