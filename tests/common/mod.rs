//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_service_core::http::RequestHead;
use http_service_core::{
    BodyConsumer, HandlerContext, HandlerHook, HandlerInfo, HttpHandler, HttpRequest,
    HttpResponder, HttpResponderExt, HttpService, Routes, ServiceBuilder, ServiceConfig,
};
use parking_lot::Mutex;
use serde_json::json;

/// Handler exercising every routing and body mode the service supports.
#[derive(Default)]
pub struct TestHandler {
    pub inits: AtomicUsize,
    pub destroys: AtomicUsize,
}

impl HttpHandler for TestHandler {
    fn base_path(&self) -> &str {
        "/test/v1"
    }

    fn name(&self) -> &str {
        "TestHandler"
    }

    fn register(self: Arc<Self>, routes: &mut Routes) {
        routes.get("resource", "testGet").buffered(|_, responder, _| {
            responder.send_json(
                StatusCode::OK,
                &json!({"status": "Handled get in resource end-point"}),
            );
            Ok(())
        });
        routes.get("tweets/{id}", "testGetTweet").param("id").buffered(|_, responder, args| {
            let id: String = args.get(0)?;
            responder.send_json(
                StatusCode::OK,
                &json!({"status": format!("Handled get in tweets end-point, id: {id}")}),
            );
            Ok(())
        });
        routes.put("tweets/{id}", "testPutTweet").param("id").buffered(|_, responder, args| {
            let id: String = args.get(0)?;
            responder.send_json(
                StatusCode::OK,
                &json!({"status": format!("Handled put in tweets end-point, id: {id}")}),
            );
            Ok(())
        });
        routes
            .delete("facebook/{id}/message", "testNoMethodRoute")
            .param("id")
            .buffered(|_, _, _| Ok(()));
        for (method, verb) in [(http::Method::PUT, "put"), (http::Method::POST, "post")] {
            routes
                .route(method, "facebook/{id}/message", verb)
                .param("id")
                .buffered(move |request, responder, args| {
                    let id: String = args.get(0)?;
                    let content = request.body_string();
                    responder.send_json(
                        StatusCode::OK,
                        &json!({"result": format!("Handled {verb} in tweets end-point, id: {id}. Content: {content}")}),
                    );
                    Ok(())
                });
        }
        for template in [
            "/user/{userId}/message/{messageId}",
            "/message/{messageId}/user/{userId}",
        ] {
            routes
                .get(template, "testMultipleParametersInPath")
                .param("userId")
                .param("messageId")
                .buffered(|_, responder, args| {
                    let user: String = args.get(0)?;
                    let message: i32 = args.get(1)?;
                    responder.send_json(
                        StatusCode::OK,
                        &json!({"result": format!("Handled multiple path parameters {user} {message}")}),
                    );
                    Ok(())
                });
        }
        routes
            .get("/exception", "exception")
            .buffered(|_, _, _| Err(anyhow::anyhow!("Illegal argument")));
        routes.get("/uexception", "testException").buffered(|_, _, _| {
            let cause = std::io::Error::new(std::io::ErrorKind::Other, "User Exception");
            Err(anyhow::Error::new(cause).context("propagated from handler"))
        });

        routes.get("/multi-match/**", "multiMatchAll").buffered(|_, responder, _| {
            responder.send_string(StatusCode::OK, "multi-match-*");
            Ok(())
        });
        routes.get("/multi-match/foo", "multiMatchFoo").buffered(|_, responder, _| {
            responder.send_string(StatusCode::OK, "multi-match-get-actual-foo");
            Ok(())
        });
        routes.put("/multi-match/foo", "multiMatchParamPut").buffered(|_, responder, _| {
            responder.send_string(StatusCode::OK, "multi-match-put-actual-foo");
            Ok(())
        });
        for (template, prefix) in [
            ("/multi-match/{param}", "multi-match-param-"),
            ("/multi-match/{param}/bar", "multi-match-param-bar-"),
            ("/multi-match/foo/{param}", "multi-match-get-foo-param-"),
            ("/multi-match/foo/{param}/bar", "multi-match-foo-param-bar-"),
            ("/multi-match/foo/bar/{param}", "multi-match-foo-bar-param-"),
            ("/multi-match/foo/{param}/bar/baz", "multi-match-foo-param-bar-baz-"),
        ] {
            routes.get(template, prefix).param("param").buffered(move |_, responder, args| {
                let param: String = args.get(0)?;
                responder.send_string(StatusCode::OK, &format!("{prefix}{param}"));
                Ok(())
            });
        }
        routes
            .get("/multi-match/foo/bar/{param}/{id}", "multiMatchFooBarParamId")
            .param("param")
            .param("id")
            .buffered(|_, responder, args| {
                let param: String = args.get(0)?;
                let id: String = args.get(1)?;
                responder.send_string(
                    StatusCode::OK,
                    &format!("multi-match-foo-bar-param-{param}-id-{id}"),
                );
                Ok(())
            });

        routes
            .put("/stream/upload", "streamUpload")
            .streaming(|_, _, _| Ok(Upload::default()));
        routes.put("/stream/upload/fail", "streamUploadFailure").streaming(|_, _, _| {
            Ok(Upload {
                fail_at: Some(2),
                ..Upload::default()
            })
        });
        routes.put("/aggregate/upload", "aggregatedUpload").buffered(|request, responder, _| {
            responder.send_string(StatusCode::OK, &format!("Uploaded:{}", request.body().len()));
            Ok(())
        });
        routes.get("/chunked", "chunkedResponse").buffered(|_, responder, _| {
            responder.send_chunk_start(StatusCode::OK, http::HeaderMap::new());
            for part in ["alpha ", "beta ", "gamma"] {
                responder.send_chunk(Bytes::from_static(part.as_bytes()));
            }
            responder.send_chunk_end();
            Ok(())
        });
    }

    fn init(&self, _context: &HandlerContext) -> anyhow::Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self, _context: &HandlerContext) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts uploaded bytes, optionally failing on the n-th fragment.
#[derive(Default)]
pub struct Upload {
    received: usize,
    fragments: usize,
    fail_at: Option<usize>,
}

impl BodyConsumer for Upload {
    fn chunk(&mut self, fragment: Bytes, _responder: &mut dyn HttpResponder) -> anyhow::Result<()> {
        self.fragments += 1;
        if self.fail_at == Some(self.fragments) {
            anyhow::bail!("chunk error");
        }
        self.received += fragment.len();
        Ok(())
    }

    fn finished(self: Box<Self>, responder: &mut dyn HttpResponder) -> anyhow::Result<()> {
        responder.send_string(StatusCode::OK, &format!("Uploaded:{}", self.received));
        Ok(())
    }

    fn handle_error(self: Box<Self>, _cause: &anyhow::Error) {}
}

/// Records every hook call as `name:phase:detail`.
pub struct RecordingHook {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl HandlerHook for RecordingHook {
    fn pre_call(
        &self,
        _request: &HttpRequest,
        _responder: &mut dyn HttpResponder,
        info: &HandlerInfo,
    ) -> bool {
        self.log.lock().push(format!("{}:pre:{}", self.name, info.method_name()));
        true
    }

    fn post_call(
        &self,
        request: &RequestHead,
        status: StatusCode,
        info: &HandlerInfo,
    ) -> anyhow::Result<()> {
        let entry = format!(
            "{}:post:{}:{}:{}",
            self.name,
            info.method_name(),
            request.path(),
            status.as_u16()
        );
        self.log.lock().push(entry);
        Ok(())
    }
}

pub fn config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.threads.io_threads = 2;
    config.threads.exec_threads = 4;
    config
}

/// Build and start `builder`, returning the running service and its address.
pub fn start(builder: ServiceBuilder) -> (HttpService, SocketAddr) {
    let mut service = builder.build().expect("service builds");
    service.start().expect("service starts");
    let addr = service.local_addr().expect("running service has an address");
    (service, addr)
}

pub fn start_test_service() -> (HttpService, SocketAddr, Arc<TestHandler>) {
    let handler = Arc::new(TestHandler::default());
    let (service, addr) = start(ServiceBuilder::new(config()).handler(handler.clone()));
    (service, addr, handler)
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

pub fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("client builds")
}

/// A response read off a raw socket.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Send `body` with chunked transfer encoding, `chunk_size` bytes per chunk.
pub fn send_chunked(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: &[u8],
    chunk_size: usize,
) -> RawResponse {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(10))).expect("read timeout");

    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    );
    // The server may answer early and stop listening; later writes can fail.
    let _ = stream.write_all(head.as_bytes());
    for chunk in body.chunks(chunk_size) {
        let mut frame = format!("{:x}\r\n", chunk.len()).into_bytes();
        frame.extend_from_slice(chunk);
        frame.extend_from_slice(b"\r\n");
        if stream.write_all(&frame).is_err() {
            break;
        }
    }
    let _ = stream.write_all(b"0\r\n\r\n");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    parse_response(&raw)
}

pub fn parse_response(raw: &[u8]) -> RawResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head terminator");
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut response = RawResponse {
        status,
        headers,
        body: String::new(),
    };
    let payload = &raw[split + 4..];
    response.body = if response
        .header("transfer-encoding")
        .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
    {
        String::from_utf8_lossy(&dechunk(payload)).into_owned()
    } else {
        String::from_utf8_lossy(payload).into_owned()
    };
    response
}

fn dechunk(mut payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    while let Some(end) = payload.windows(2).position(|w| w == b"\r\n") {
        let size_line = String::from_utf8_lossy(&payload[..end]);
        let digits = size_line.split(';').next().unwrap_or("0").trim();
        let size = usize::from_str_radix(digits, 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = end + 2;
        body.extend_from_slice(&payload[start..start + size]);
        payload = &payload[start + size + 2..];
    }
    body
}

/// Poll `condition` for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
