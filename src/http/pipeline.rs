//! Per-connection processing pipeline.
//!
//! The built-in stages are fixed and run in this order:
//!
//! ```text
//! ssl (TLS only) → tracker → compressor → encoder → decoder
//!     → router → executor (exec pool only) → dispatcher
//! ```
//!
//! Built-in stages are markers: the work they name is done by the
//! connection task, hyper and tower-http. Callers extend the pipeline with
//! named `PipelineStage`s placed relative to any existing stage. Custom
//! stages placed before `router` see the decoded request head and may change
//! it before routing; every custom stage sees every outgoing response head,
//! innermost first.

use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::http::request::RequestHead;

pub const SSL: &str = "ssl";
pub const TRACKER: &str = "tracker";
pub const COMPRESSOR: &str = "compressor";
pub const ENCODER: &str = "encoder";
pub const DECODER: &str = "decoder";
pub const ROUTER: &str = "router";
pub const EXECUTOR: &str = "executor";
pub const DISPATCHER: &str = "dispatcher";

/// Caller hook that rearranges the pipeline when the service is built.
pub type PipelineExtension = Arc<dyn Fn(&mut Pipeline) -> Result<(), PipelineError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("no pipeline stage named `{0}`")]
    UnknownStage(String),

    #[error("pipeline stage `{0}` already exists")]
    DuplicateStage(String),
}

/// A caller-supplied stage.
pub trait PipelineStage: Send + Sync {
    /// Decoded request head, before routing if the stage sits before `router`.
    fn on_request(&self, _head: &mut RequestHead) {}

    /// Outgoing response head.
    fn on_response(&self, _status: StatusCode, _headers: &mut HeaderMap) {}
}

struct Stage {
    name: String,
    handler: Option<Arc<dyn PipelineStage>>,
}

/// Ordered, named stages of a connection.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl Pipeline {
    /// The built-in stages for a service.
    pub(crate) fn standard(tls: bool, executor: bool) -> Self {
        let mut names = Vec::with_capacity(8);
        if tls {
            names.push(SSL);
        }
        names.extend([TRACKER, COMPRESSOR, ENCODER, DECODER, ROUTER]);
        if executor {
            names.push(EXECUTOR);
        }
        names.push(DISPATCHER);

        Self {
            stages: names
                .into_iter()
                .map(|name| Stage {
                    name: name.to_string(),
                    handler: None,
                })
                .collect(),
        }
    }

    /// Stage names in processing order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn add_last(
        &mut self,
        name: &str,
        stage: Arc<dyn PipelineStage>,
    ) -> Result<(), PipelineError> {
        self.insert(self.stages.len(), name, stage)
    }

    pub fn add_before(
        &mut self,
        base: &str,
        name: &str,
        stage: Arc<dyn PipelineStage>,
    ) -> Result<(), PipelineError> {
        let index = self.require(base)?;
        self.insert(index, name, stage)
    }

    pub fn add_after(
        &mut self,
        base: &str,
        name: &str,
        stage: Arc<dyn PipelineStage>,
    ) -> Result<(), PipelineError> {
        let index = self.require(base)?;
        self.insert(index + 1, name, stage)
    }

    /// Let custom stages ahead of the router see the request head.
    pub(crate) fn on_request(&self, head: &mut RequestHead) {
        for stage in &self.stages {
            if stage.name == ROUTER {
                break;
            }
            if let Some(handler) = &stage.handler {
                handler.on_request(head);
            }
        }
    }

    /// Pass the response head outward through every custom stage.
    pub(crate) fn on_response(&self, status: StatusCode, headers: &mut HeaderMap) {
        for handler in self.stages.iter().rev().filter_map(|s| s.handler.as_ref()) {
            handler.on_response(status, headers);
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    fn require(&self, name: &str) -> Result<usize, PipelineError> {
        self.position(name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    fn insert(
        &mut self,
        index: usize,
        name: &str,
        stage: Arc<dyn PipelineStage>,
    ) -> Result<(), PipelineError> {
        if self.contains(name) {
            return Err(PipelineError::DuplicateStage(name.to_string()));
        }
        self.stages.insert(
            index,
            Stage {
                name: name.to_string(),
                handler: Some(stage),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::head;
    use http::HeaderValue;
    use parking_lot::Mutex;

    struct Tagging {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PipelineStage for Tagging {
        fn on_request(&self, _head: &mut RequestHead) {
            self.log.lock().push(format!("req:{}", self.tag));
        }

        fn on_response(&self, _status: StatusCode, headers: &mut HeaderMap) {
            self.log.lock().push(format!("res:{}", self.tag));
            headers.insert("x-stage", HeaderValue::from_static(self.tag));
        }
    }

    fn tagging(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn PipelineStage> {
        Arc::new(Tagging {
            tag,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn standard_order() {
        assert_eq!(
            Pipeline::standard(true, true).stage_names(),
            vec![
                "ssl",
                "tracker",
                "compressor",
                "encoder",
                "decoder",
                "router",
                "executor",
                "dispatcher"
            ]
        );
        assert_eq!(
            Pipeline::standard(false, false).stage_names(),
            vec!["tracker", "compressor", "encoder", "decoder", "router", "dispatcher"]
        );
    }

    #[test]
    fn stages_insert_relative_to_existing_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::standard(false, true);
        pipeline.add_after(DECODER, "test", tagging("test", &log)).unwrap();
        pipeline.add_before(TRACKER, "first", tagging("first", &log)).unwrap();
        pipeline.add_last("tail", tagging("tail", &log)).unwrap();

        assert_eq!(
            pipeline.stage_names(),
            vec![
                "first",
                "tracker",
                "compressor",
                "encoder",
                "decoder",
                "test",
                "router",
                "executor",
                "dispatcher",
                "tail"
            ]
        );
        assert_eq!(
            pipeline.add_after("missing", "x", tagging("x", &log)),
            Err(PipelineError::UnknownStage("missing".into()))
        );
        assert_eq!(
            pipeline.add_last("test", tagging("test", &log)),
            Err(PipelineError::DuplicateStage("test".into()))
        );
    }

    #[test]
    fn requests_stop_at_router_responses_see_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::standard(false, false);
        pipeline.add_after(DECODER, "inner", tagging("inner", &log)).unwrap();
        pipeline.add_before(TRACKER, "outer", tagging("outer", &log)).unwrap();
        pipeline.add_last("tail", tagging("tail", &log)).unwrap();

        let mut request = head("/x");
        pipeline.on_request(&mut request);
        let mut headers = HeaderMap::new();
        pipeline.on_response(StatusCode::OK, &mut headers);

        assert_eq!(
            *log.lock(),
            vec!["req:outer", "req:inner", "res:tail", "res:inner", "res:outer"]
        );
        assert_eq!(headers["x-stage"], "outer");
    }
}
