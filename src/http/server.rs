//! Per-connection serving.
//!
//! # Responsibilities
//! - Register the connection, run the TLS handshake when enabled
//! - Drive hyper's HTTP/1.1 connection with response compression
//! - Route each request and hand it to the connection's execution lane
//! - Pump streamed request bodies into the lane as chunk events
//! - Close gracefully when the service asks
//!
//! # Design Decisions
//! - Handler code never runs in this task's future directly; it goes
//!   through the lane, which may run it inline or on the executor pool
//! - The response head arrives over a oneshot; a handler that never
//!   answers resolves to a 500 as soon as its responder is released

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, CONNECTION};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tower::Layer;
use tower_http::compression::CompressionLayer;
use tracing::Instrument;

use crate::execution::{ExecutionLane, ExecutorPool};
use crate::http::dispatcher::TransportEvent;
use crate::http::hooks::{HookChain, HookResponder};
use crate::http::invocation::{HaltSignal, InvocationState, FAULT_MESSAGE_PREFIX};
use crate::http::pipeline::Pipeline;
use crate::http::request::{HttpRequest, RequestHead, RequestId};
use crate::http::responder::{ChannelResponder, ResponseBody, ResponseHead};
use crate::net::{ConnectionId, ConnectionRegistry, SocketOptions, TlsSessionFactory};
use crate::observability::metrics;
use crate::routing::{RequestRouter, ResolvedRoute, RouteOutcome};

/// Largest body a streaming request may carry and still arrive with its head.
pub const INLINE_BODY_LIMIT: usize = 8 * 1024;

/// State shared by every connection of a running service.
pub(crate) struct ServerShared {
    pub router: Arc<dyn RequestRouter>,
    pub hooks: HookChain,
    pub pipeline: Arc<Pipeline>,
    pub pool: Option<Arc<ExecutorPool>>,
    pub max_chunk_size: usize,
    pub registry: Arc<ConnectionRegistry>,
    pub tls: Option<TlsSessionFactory>,
    pub socket_options: SocketOptions,
    /// Set once the service stops; late connections are dropped.
    pub closing: AtomicBool,
}

struct ConnectionContext {
    id: ConnectionId,
    shared: Arc<ServerShared>,
    lane: ExecutionLane,
}

/// Serve one accepted socket until either side closes it.
pub(crate) async fn serve_connection(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
) {
    let guard = shared.registry.register(peer);
    if shared.closing.load(Ordering::Acquire) {
        tracing::debug!(connection = %guard.id(), %peer, "Service closing, dropping connection");
        return;
    }

    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                connection = %guard.id(),
                %peer,
                error = %e,
                "Cannot register connection"
            );
            return;
        }
    };
    if let Err(e) = shared.socket_options.apply_to_stream(&stream) {
        tracing::debug!(connection = %guard.id(), error = %e, "Cannot apply socket options");
    }

    let mut close = guard.closer().subscribe();
    let context = Arc::new(ConnectionContext {
        id: guard.id(),
        lane: ExecutionLane::new(shared.pool.clone(), guard.id(), guard.closer().clone()),
        shared: Arc::clone(&shared),
    });
    tracing::debug!(connection = %guard.id(), %peer, "Connection accepted");

    match &shared.tls {
        Some(factory) => {
            let acceptor = factory.create();
            let stream = tokio::select! {
                result = acceptor.accept(stream) => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(
                            connection = %guard.id(),
                            %peer,
                            error = %e,
                            "TLS handshake failed"
                        );
                        return;
                    }
                },
                _ = closed(&mut close) => return,
            };
            serve_http(stream, context, close).await;
        }
        None => serve_http(stream, context, close).await,
    }

    tracing::debug!(connection = %guard.id(), %peer, "Connection closed");
}

async fn serve_http<I>(io: I, context: Arc<ConnectionContext>, mut close: watch::Receiver<bool>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = context.id;
    let service = tower::service_fn(move |request: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { Ok::<_, Infallible>(handle_request(context, request).await) }
    });
    let service = TowerToHyperService::new(CompressionLayer::new().layer(service));

    let connection = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(connection = %id, error = %e, "Connection error");
            }
        }
        _ = closed(&mut close) => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                tracing::debug!(connection = %id, error = %e, "Connection error while closing");
            }
        }
    }
}

/// Resolves once the connection is asked to close.
async fn closed(close: &mut watch::Receiver<bool>) {
    let _ = close.wait_for(|closing| *closing).await;
}

async fn handle_request(
    context: Arc<ConnectionContext>,
    request: Request<Incoming>,
) -> Response<ResponseBody> {
    let (parts, body) = request.into_parts();
    let mut head = RequestHead::from_parts(parts);
    let span = tracing::info_span!(
        "request",
        connection = %context.id,
        request_id = %RequestId::new(),
        method = %head.method,
        path = head.path()
    );

    async move {
        let shared = &context.shared;
        shared.pipeline.on_request(&mut head);
        let keep_alive = head.is_keep_alive();

        let mut response = match shared.router.route(&head) {
            RouteOutcome::NotFound => not_routed(&head, StatusCode::NOT_FOUND),
            RouteOutcome::MethodNotAllowed => not_routed(&head, StatusCode::METHOD_NOT_ALLOWED),
            RouteOutcome::Matched(resolved) => invoke(&context, head, body, resolved).await,
        };

        if keep_alive {
            response.headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        shared.pipeline.on_response(response.status, &mut response.headers);
        metrics::record_response(response.status);
        tracing::debug!(status = response.status.as_u16(), "Response ready");
        response.into_response()
    }
    .instrument(span)
    .await
}

fn not_routed(head: &RequestHead, status: StatusCode) -> ResponseHead {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    tracing::debug!(status = status.as_u16(), "Request not routed");
    ResponseHead::text(status, &format!("Problem accessing: {}. Reason: {}", head.path(), reason))
}

async fn invoke(
    context: &ConnectionContext,
    head: RequestHead,
    body: Incoming,
    resolved: ResolvedRoute,
) -> ResponseHead {
    let shared = &context.shared;
    let streaming = resolved.handler.is_streaming();
    let chunked = streaming
        && (head.is_transfer_chunked()
            || head.content_length().is_some_and(|len| len > INLINE_BODY_LIMIT as u64));

    let (request, body) = if chunked {
        (HttpRequest::chunked(head.clone()), Some(body))
    } else {
        let limit = if streaming { INLINE_BODY_LIMIT } else { shared.max_chunk_size };
        match aggregate(body, limit).await {
            Ok(content) => (HttpRequest::new(head.clone(), content), None),
            Err(e) => {
                tracing::warn!(
                    handler = %resolved.info,
                    limit,
                    error = %e,
                    "Cannot aggregate request body"
                );
                return ResponseHead::text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("{FAULT_MESSAGE_PREFIX}{e}"),
                );
            }
        }
    };

    let (responder, head_rx) = ChannelResponder::channel();
    let info = Arc::clone(&resolved.info);
    let responder = HookResponder::new(responder, shared.hooks.clone(), head, info);
    let state = InvocationState::new(resolved, request, Box::new(responder), shared.hooks.clone());
    let halt = state.halt_signal();

    if let Err(e) = context.lane.submit(TransportEvent::Head(state)) {
        tracing::warn!(error = %e, "Request refused by the executor");
        return ResponseHead::text(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
    }
    if let Some(body) = body {
        tokio::spawn(pump_body(body, context.lane.clone(), halt).in_current_span());
    }

    match head_rx.await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("Handler returned without responding");
            ResponseHead::text(StatusCode::INTERNAL_SERVER_ERROR, "No response produced")
        }
    }
}

/// Collect a whole body of at most `limit` bytes.
///
/// An oversized body is still read to its end so the connection can answer
/// the client instead of resetting under it.
async fn aggregate(mut body: Incoming, limit: usize) -> anyhow::Result<Bytes> {
    let mut content = BytesMut::new();
    let mut received = 0usize;
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame.context("reading request body")?.into_data() else {
            continue;
        };
        received = received.saturating_add(data.len());
        if received <= limit {
            content.extend_from_slice(&data);
        }
    }
    if received > limit {
        anyhow::bail!("request body of {received} bytes exceeds the limit of {limit} bytes");
    }
    Ok(content.freeze())
}

/// Feed a streamed body to the lane.
///
/// Reading waits while the lane's body buffer is full. Once the request
/// halts, the rest of the body is read and discarded.
async fn pump_body(mut body: Incoming, lane: ExecutionLane, halt: HaltSignal) {
    let mut refused = false;
    loop {
        let event = match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) if !data.is_empty() => TransportEvent::Chunk { data, last: false },
                // Empty data and trailers carry nothing for the consumer.
                _ => continue,
            },
            Some(Err(e)) => {
                TransportEvent::Abort(anyhow::Error::new(e).context("reading request body"))
            }
            None => TransportEvent::Chunk {
                data: Bytes::new(),
                last: true,
            },
        };
        let terminal = !matches!(event, TransportEvent::Chunk { last: false, .. });
        if !refused && !halt.is_halted() {
            if let Err(e) = lane.submit_throttled(event).await {
                tracing::warn!(
                    connection = %lane.connection(),
                    error = %e,
                    "Body fragment refused by the executor"
                );
                refused = true;
            }
        }
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_spawnable<F>(_: fn(std::net::TcpStream, SocketAddr, Arc<ServerShared>) -> F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
    }

    #[test]
    fn connection_future_is_spawnable() {
        assert_spawnable(serve_connection);
    }
}
