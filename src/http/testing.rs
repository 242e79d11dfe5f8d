//! Test doubles shared by the HTTP layer's unit tests.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::Mutex;

use crate::http::hooks::HandlerHook;
use crate::http::request::{HttpRequest, RequestHead};
use crate::http::responder::HttpResponder;
use crate::routing::HandlerInfo;

pub fn head(path: &str) -> RequestHead {
    RequestHead::new(Method::GET, path.parse::<Uri>().unwrap())
}

pub fn info() -> Arc<HandlerInfo> {
    Arc::new(HandlerInfo::new("TestHandler", "test"))
}

/// Everything a responder was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Full(StatusCode, Bytes),
    ChunkStart(StatusCode),
    Chunk(Bytes),
    ChunkEnd,
}

/// Responder that records calls; clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingResponder {
    sent: Arc<Mutex<Vec<Sent>>>,
}

impl RecordingResponder {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn statuses(&self) -> Vec<StatusCode> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Full(status, _) | Sent::ChunkStart(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Body of the first full response, as text.
    pub fn body(&self) -> Option<String> {
        self.sent.lock().iter().find_map(|s| match s {
            Sent::Full(_, body) => Some(String::from_utf8_lossy(body).into_owned()),
            _ => None,
        })
    }
}

impl HttpResponder for RecordingResponder {
    fn send_status(&mut self, status: StatusCode, _headers: HeaderMap) {
        self.sent.lock().push(Sent::Full(status, Bytes::new()));
    }

    fn send_content(
        &mut self,
        status: StatusCode,
        content: Bytes,
        _content_type: &str,
        _headers: HeaderMap,
    ) {
        self.sent.lock().push(Sent::Full(status, content));
    }

    fn send_error(&mut self, status: StatusCode, message: &str) {
        self.sent.lock().push(Sent::Full(status, Bytes::copy_from_slice(message.as_bytes())));
    }

    fn send_file(&mut self, _path: &Path, _headers: HeaderMap) -> StatusCode {
        self.send_status(StatusCode::OK, HeaderMap::new());
        StatusCode::OK
    }

    fn send_chunk_start(&mut self, status: StatusCode, _headers: HeaderMap) {
        self.sent.lock().push(Sent::ChunkStart(status));
    }

    fn send_chunk(&mut self, content: Bytes) {
        self.sent.lock().push(Sent::Chunk(content));
    }

    fn send_chunk_end(&mut self) {
        self.sent.lock().push(Sent::ChunkEnd);
    }
}

/// Hook that appends `name:pre` and `name:<status>` to a shared log.
pub struct RecordingHook {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingHook {
    pub fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn HandlerHook> {
        Arc::new(Self {
            name,
            log: Arc::clone(log),
        })
    }
}

impl HandlerHook for RecordingHook {
    fn pre_call(
        &self,
        _request: &HttpRequest,
        _responder: &mut dyn HttpResponder,
        _info: &HandlerInfo,
    ) -> bool {
        self.log.lock().push(format!("{}:pre", self.name));
        true
    }

    fn post_call(
        &self,
        _request: &RequestHead,
        status: StatusCode,
        _info: &HandlerInfo,
    ) -> anyhow::Result<()> {
        self.log.lock().push(format!("{}:{}", self.name, status.as_u16()));
        Ok(())
    }
}
