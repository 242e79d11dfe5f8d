//! Response writing.
//!
//! # Responsibilities
//! - Define the `HttpResponder` contract handlers answer through
//! - Bridge synchronous handler code to the async connection task
//! - Stream chunked responses without blocking the handler thread
//!
//! # Design Decisions
//! - The response head travels over a oneshot; the connection task awaits it
//! - Chunked bodies use an unbounded channel so a slow client never blocks
//!   an execution thread
//! - A responder dropped mid-stream aborts the body instead of ending it, so
//!   the client never mistakes a truncated response for a complete one

use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use http_body::{Body, Frame, SizeHint};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Writes the response for one request.
///
/// Exactly one terminal call is expected: `send_status`, `send_content`,
/// `send_error`, `send_file`, or `send_chunk_start` followed by
/// `send_chunk`* and `send_chunk_end`.
pub trait HttpResponder: Send {
    /// Respond with a status and headers, no body.
    fn send_status(&mut self, status: StatusCode, headers: HeaderMap);

    /// Respond with a complete body.
    fn send_content(
        &mut self,
        status: StatusCode,
        content: Bytes,
        content_type: &str,
        headers: HeaderMap,
    );

    /// Respond with an error status and a plain-text message.
    fn send_error(&mut self, status: StatusCode, message: &str);

    /// Respond with the contents of a file. Returns the status actually sent.
    fn send_file(&mut self, path: &Path, headers: HeaderMap) -> StatusCode;

    /// Start a chunked response.
    fn send_chunk_start(&mut self, status: StatusCode, headers: HeaderMap);

    /// Send one fragment of a chunked response.
    fn send_chunk(&mut self, content: Bytes);

    /// Finish a chunked response.
    fn send_chunk_end(&mut self);

    /// Respond with UTF-8 text.
    fn send_string(&mut self, status: StatusCode, data: &str) {
        self.send_content(
            status,
            Bytes::copy_from_slice(data.as_bytes()),
            "text/plain; charset=utf-8",
            HeaderMap::new(),
        );
    }

    /// Respond with raw bytes.
    fn send_bytes(&mut self, status: StatusCode, content: Bytes, headers: HeaderMap) {
        self.send_content(status, content, "application/octet-stream", headers);
    }
}

/// Serialization helpers available on every responder.
pub trait HttpResponderExt: HttpResponder {
    /// Respond with `value` serialized as JSON.
    fn send_json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.send_content(status, Bytes::from(body), "application/json", HeaderMap::new())
            }
            Err(e) => self.send_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to serialize response: {e}"),
            ),
        }
    }
}

impl<R: HttpResponder + ?Sized> HttpResponderExt for R {}

/// The response stream was cut short.
#[derive(Debug, Clone, Copy, Error)]
#[error("response stream aborted")]
pub struct ResponseAborted;

type ChunkSender = mpsc::UnboundedSender<Result<Bytes, ResponseAborted>>;
type ChunkReceiver = mpsc::UnboundedReceiver<Result<Bytes, ResponseAborted>>;

/// Body of a response produced by a handler.
#[derive(Debug)]
pub struct ResponseBody {
    kind: BodyKind,
}

#[derive(Debug)]
enum BodyKind {
    Empty,
    Full(Option<Bytes>),
    Streaming(ChunkReceiver),
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self { kind: BodyKind::Empty }
    }

    pub fn full(content: Bytes) -> Self {
        Self {
            kind: BodyKind::Full(Some(content)),
        }
    }

    fn streaming(rx: ChunkReceiver) -> Self {
        Self {
            kind: BodyKind::Streaming(rx),
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = ResponseAborted;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ResponseAborted>>> {
        match &mut self.kind {
            BodyKind::Empty => Poll::Ready(None),
            BodyKind::Full(content) => Poll::Ready(content.take().map(|c| Ok(Frame::data(c)))),
            BodyKind::Streaming(rx) => rx
                .poll_recv(cx)
                .map(|item| item.map(|chunk| chunk.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::Full(content) => content.is_none(),
            BodyKind::Streaming(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            BodyKind::Empty | BodyKind::Full(None) => SizeHint::with_exact(0),
            BodyKind::Full(Some(content)) => SizeHint::with_exact(content.len() as u64),
            BodyKind::Streaming(_) => SizeHint::default(),
        }
    }
}

/// Status, headers and body of a handler's response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl ResponseHead {
    /// Plain-text response produced by the server itself.
    pub fn text(status: StatusCode, message: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        Self {
            status,
            headers,
            body: ResponseBody::full(Bytes::copy_from_slice(message.as_bytes())),
        }
    }

    pub fn into_response(self) -> http::Response<ResponseBody> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Transport-facing responder for one request.
///
/// The first terminal call sends the head to the waiting connection task;
/// later terminal calls are ignored, or abort a chunked body already started.
#[derive(Debug)]
pub struct ChannelResponder {
    head: Option<oneshot::Sender<ResponseHead>>,
    chunks: Option<ChunkSender>,
}

impl ChannelResponder {
    /// A responder plus the receiver the connection task awaits.
    pub fn channel() -> (Self, oneshot::Receiver<ResponseHead>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                head: Some(tx),
                chunks: None,
            },
            rx,
        )
    }

    /// Whether a terminal response was sent or started.
    pub fn is_committed(&self) -> bool {
        self.head.is_none()
    }

    fn commit(&mut self, head: ResponseHead) {
        match self.head.take() {
            Some(tx) => {
                // The connection task is gone when this fails; nothing to tell it.
                let _ = tx.send(head);
            }
            None if self.chunks.is_some() => {
                tracing::debug!(
                    status = %head.status,
                    "Terminal response after chunk start; aborting stream"
                );
                self.abort_stream();
            }
            None => {
                tracing::warn!(status = %head.status, "Response already sent; ignoring");
            }
        }
    }

    fn abort_stream(&mut self) {
        if let Some(chunks) = self.chunks.take() {
            let _ = chunks.send(Err(ResponseAborted));
        }
    }
}

impl HttpResponder for ChannelResponder {
    fn send_status(&mut self, status: StatusCode, headers: HeaderMap) {
        self.commit(ResponseHead {
            status,
            headers,
            body: ResponseBody::empty(),
        });
    }

    fn send_content(
        &mut self,
        status: StatusCode,
        content: Bytes,
        content_type: &str,
        mut headers: HeaderMap,
    ) {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        self.commit(ResponseHead {
            status,
            headers,
            body: ResponseBody::full(content),
        });
    }

    fn send_error(&mut self, status: StatusCode, message: &str) {
        self.commit(ResponseHead::text(status, message));
    }

    fn send_file(&mut self, path: &Path, headers: HeaderMap) -> StatusCode {
        match std::fs::read(path) {
            Ok(content) => {
                self.send_bytes(StatusCode::OK, Bytes::from(content), headers);
                StatusCode::OK
            }
            Err(e) => {
                let status = if e.kind() == std::io::ErrorKind::NotFound {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                tracing::debug!(path = %path.display(), error = %e, "Cannot send file");
                self.send_error(status, &format!("Cannot read file: {}", path.display()));
                status
            }
        }
    }

    fn send_chunk_start(&mut self, status: StatusCode, headers: HeaderMap) {
        if self.is_committed() {
            self.commit(ResponseHead {
                status,
                headers,
                body: ResponseBody::empty(),
            });
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.commit(ResponseHead {
            status,
            headers,
            body: ResponseBody::streaming(rx),
        });
        self.chunks = Some(tx);
    }

    fn send_chunk(&mut self, content: Bytes) {
        match &self.chunks {
            Some(chunks) => {
                let _ = chunks.send(Ok(content));
            }
            None => tracing::warn!("Chunk sent without an open chunked response"),
        }
    }

    fn send_chunk_end(&mut self) {
        // Dropping the sender ends the body cleanly.
        self.chunks = None;
    }
}

impl Drop for ChannelResponder {
    fn drop(&mut self) {
        self.abort_stream();
    }
}
