//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Resolve a request head to one handler method and its arguments
//! - Distinguish "no such path" from "path exists, wrong method"
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) template scan; typical services register tens of routes
//! - Ties between equally specific templates go to the first registered
//! - Explicit NotFound / MethodNotAllowed rather than silent default

use std::sync::Arc;

use http::Method;

use crate::http::request::RequestHead;
use crate::routing::handler::{Args, HandlerInfo, HandlerMethod, Route};
use crate::routing::matcher::split_path;
use crate::routing::RouteError;

/// A request resolved to a handler method.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub info: Arc<HandlerInfo>,
    pub handler: HandlerMethod,
    pub args: Args,
}

/// Result of routing one request.
#[derive(Debug)]
pub enum RouteOutcome {
    /// No template matches the path.
    NotFound,
    /// A template matches, but not for this method.
    MethodNotAllowed,
    Matched(ResolvedRoute),
}

/// Resolves requests to handler methods.
pub trait RequestRouter: Send + Sync {
    fn route(&self, head: &RequestHead) -> RouteOutcome;
}

/// Default router over path templates.
#[derive(Debug, Default)]
pub struct PathRouter {
    routes: Vec<Route>,
}

impl PathRouter {
    /// Build a router, rejecting two routes with the same method and path shape.
    pub fn new(routes: Vec<Route>) -> Result<Self, Vec<RouteError>> {
        let mut errors = Vec::new();
        for (index, route) in routes.iter().enumerate() {
            let duplicate = routes[..index].iter().any(|earlier| {
                earlier.method == route.method && earlier.template.same_shape(&route.template)
            });
            if duplicate {
                errors.push(RouteError::Duplicate {
                    method: route.method.clone(),
                    template: route.template.to_string(),
                });
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        tracing::debug!(routes = routes.len(), "Routes compiled");
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RequestRouter for PathRouter {
    fn route(&self, head: &RequestHead) -> RouteOutcome {
        let path: Vec<&str> = split_path(head.path()).collect();

        let mut path_matched = false;
        let mut best: Option<(Vec<u8>, &Route, Vec<(&str, &str)>)> = None;
        for route in &self.routes {
            let Some(captures) = route.template.matches(&path) else {
                continue;
            };
            path_matched = true;
            if route.method != head.method {
                continue;
            }
            let rank = route.template.rank();
            if best.as_ref().map_or(true, |(best_rank, _, _)| rank < *best_rank) {
                best = Some((rank, route, captures));
            }
        }

        match best {
            Some((_, route, captures)) => RouteOutcome::Matched(resolve(route, &captures)),
            None if path_matched => RouteOutcome::MethodNotAllowed,
            None => RouteOutcome::NotFound,
        }
    }
}

fn resolve(route: &Route, captures: &[(&str, &str)]) -> ResolvedRoute {
    let values = route
        .params
        .iter()
        .map(|name| {
            let raw = captures
                .iter()
                .find(|(n, _)| *n == name.as_str())
                .map_or("", |(_, value)| *value);
            urlencoding::decode(raw)
                .map_or_else(|_| raw.to_string(), |decoded| decoded.into_owned())
        })
        .collect();

    ResolvedRoute {
        info: Arc::clone(&route.info),
        handler: route.handler.clone(),
        args: Args::new(Arc::clone(&route.params), values),
    }
}

/// Router that answers every request with the same handler method.
///
/// Useful as an override when an application does its own dispatching.
pub struct FixedRouter {
    info: Arc<HandlerInfo>,
    handler: HandlerMethod,
    methods: Option<Vec<Method>>,
}

impl FixedRouter {
    pub fn new(info: HandlerInfo, handler: HandlerMethod) -> Self {
        Self {
            info: Arc::new(info),
            handler,
            methods: None,
        }
    }

    /// Restrict the methods answered; others get 405.
    pub fn methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = Some(methods);
        self
    }
}

impl RequestRouter for FixedRouter {
    fn route(&self, head: &RequestHead) -> RouteOutcome {
        if let Some(methods) = &self.methods {
            if !methods.contains(&head.method) {
                return RouteOutcome::MethodNotAllowed;
            }
        }
        RouteOutcome::Matched(ResolvedRoute {
            info: Arc::clone(&self.info),
            handler: self.handler.clone(),
            args: Args::default(),
        })
    }
}
