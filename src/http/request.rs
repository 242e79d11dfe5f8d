//! Request view handed to handlers.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for tracing
//! - Expose the decoded request head (method, URI, version, headers)
//! - Carry the aggregated body, or mark the request as streamed
//!
//! # Design Decisions
//! - The head is a plain owned value so hooks and responders can keep a copy
//!   after the handler consumed the request
//! - "Chunked" means the body arrives through a `BodyConsumer`, independent of
//!   the wire encoding

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri, Version};
use uuid::Uuid;

/// Unique identifier for a single request, used in tracing spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decoded request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Build a head from decoded request parts.
    pub fn from_parts(parts: http::request::Parts) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
        }
    }

    /// A head with no headers, mostly for tests and custom routers.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Whether the request declared `Transfer-Encoding: chunked`.
    pub fn is_transfer_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|coding| coding.trim().eq_ignore_ascii_case("chunked")))
    }

    /// Declared `Content-Length`, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the connection stays open after this request.
    pub fn is_keep_alive(&self) -> bool {
        let connection = |token: &str| {
            self.headers
                .get_all(CONNECTION)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        };
        match self.version {
            Version::HTTP_10 | Version::HTTP_09 => connection("keep-alive"),
            _ => !connection("close"),
        }
    }
}

/// A request as seen by a handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    head: RequestHead,
    body: Bytes,
    chunked: bool,
}

impl HttpRequest {
    /// A request whose body is already in hand.
    pub fn new(head: RequestHead, body: Bytes) -> Self {
        Self {
            head,
            body,
            chunked: false,
        }
    }

    /// A request whose body will arrive as separate fragments.
    pub fn chunked(head: RequestHead) -> Self {
        Self {
            head,
            body: Bytes::new(),
            chunked: true,
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut RequestHead {
        &mut self.head
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Aggregated body. Empty for streamed requests.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the body is delivered through a consumer.
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Present the request as streamed and return any body already in hand.
    pub(crate) fn detach_body(&mut self) -> Bytes {
        self.chunked = true;
        std::mem::take(&mut self.body)
    }
}
