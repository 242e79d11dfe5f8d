//! Per-connection execution lane.
//!
//! Events of one connection are queued on its lane and drained by at most
//! one task at a time, so they run in arrival order and never concurrently,
//! while lanes of different connections run in parallel on the pool.
//!
//! Every queued event is charged against the pool's pending-bytes limit
//! until it has been processed. An event the pool refuses fails the request
//! it belongs to: the attached state is aborted and the rest of its body is
//! dropped, so a consumer never completes over a gap.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::execution::policy::Task;
use crate::execution::pool::ExecutorPool;
use crate::execution::ExecutionError;
use crate::http::dispatcher::{Dispatcher, TransportEvent};
use crate::http::invocation::{InvocationError, InvocationState};
use crate::net::connection::{ConnectionCloser, ConnectionId};

/// Body bytes a connection may have queued before reading pauses.
pub const DEFAULT_BUFFER_LIMIT: usize = 256 * 1024;

struct Queued {
    event: TransportEvent,
    /// Bytes reserved on the pool for this event.
    charged: usize,
    permit: Option<OwnedSemaphorePermit>,
}

impl Queued {
    fn uncharged(event: TransportEvent) -> Self {
        Self {
            event,
            charged: 0,
            permit: None,
        }
    }
}

#[derive(Default)]
struct LaneQueue {
    events: VecDeque<Queued>,
    running: bool,
    /// An event of the current request was refused; drop the rest of it.
    refused: bool,
}

impl LaneQueue {
    fn push(&mut self, queued: Queued) {
        if matches!(queued.event, TransportEvent::Head(_)) {
            self.refused = false;
        }
        self.events.push_back(queued);
    }

    /// Whether `event` belongs to a request already failed by a refusal.
    fn drops(&self, event: &TransportEvent) -> bool {
        self.refused && !matches!(event, TransportEvent::Head(_))
    }
}

struct LaneInner {
    pool: Option<Arc<ExecutorPool>>,
    queue: Mutex<LaneQueue>,
    idle: Condvar,
    attachment: Mutex<Option<InvocationState>>,
    buffer: Arc<Semaphore>,
    buffer_limit: usize,
    dispatcher: Dispatcher,
    closer: ConnectionCloser,
    connection: ConnectionId,
}

/// Ordered event queue of one connection.
#[derive(Clone)]
pub struct ExecutionLane {
    inner: Arc<LaneInner>,
}

impl std::fmt::Debug for ExecutionLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLane")
            .field("connection", &self.inner.connection)
            .field("pooled", &self.inner.pool.is_some())
            .field("buffer_limit", &self.inner.buffer_limit)
            .finish()
    }
}

impl ExecutionLane {
    /// Without a pool, events are dispatched on the submitting thread.
    pub fn new(
        pool: Option<Arc<ExecutorPool>>,
        connection: ConnectionId,
        closer: ConnectionCloser,
    ) -> Self {
        Self::with_buffer_limit(pool, connection, closer, DEFAULT_BUFFER_LIMIT)
    }

    pub fn with_buffer_limit(
        pool: Option<Arc<ExecutorPool>>,
        connection: ConnectionId,
        closer: ConnectionCloser,
        buffer_limit: usize,
    ) -> Self {
        let buffer_limit = buffer_limit.clamp(1, u32::MAX as usize);
        Self {
            inner: Arc::new(LaneInner {
                pool,
                queue: Mutex::new(LaneQueue::default()),
                idle: Condvar::new(),
                attachment: Mutex::new(None),
                buffer: Arc::new(Semaphore::new(buffer_limit)),
                buffer_limit,
                dispatcher: Dispatcher,
                closer,
                connection,
            }),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.inner.connection
    }

    /// Queue `event` behind the connection's earlier events.
    ///
    /// An event over the pool's pending-bytes limit goes to the rejection
    /// policy. Unless the policy runs it, the current request is aborted and
    /// any error from the policy is returned.
    pub fn submit(&self, event: TransportEvent) -> Result<(), ExecutionError> {
        self.enqueue(event, None)
    }

    /// Like [`submit`](Self::submit), but first waits until the lane has
    /// room for the event in its body buffer.
    pub async fn submit_throttled(&self, event: TransportEvent) -> Result<(), ExecutionError> {
        let permits = event.estimated_cost().min(self.inner.buffer_limit);
        let permits = u32::try_from(permits).unwrap_or(u32::MAX);
        // The semaphore is never closed.
        let permit = Arc::clone(&self.inner.buffer).acquire_many_owned(permits).await.ok();
        self.enqueue(event, permit)
    }

    fn enqueue(
        &self,
        event: TransportEvent,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), ExecutionError> {
        let inner = &self.inner;
        if inner.queue.lock().drops(&event) {
            tracing::debug!(
                connection = %inner.connection,
                event = event.kind(),
                "Dropping event of a failed request"
            );
            return Ok(());
        }

        let cost = event.estimated_cost();
        let charged = match &inner.pool {
            Some(pool) if !pool.try_reserve(cost) => {
                let refused = RefusedEvent {
                    inner: Arc::clone(inner),
                    queued: Some(Queued {
                        event,
                        charged: 0,
                        permit,
                    }),
                };
                return pool.reject(Task::new(cost, move || refused.run_on_caller()));
            }
            Some(_) => cost,
            None => 0,
        };

        let start = {
            let mut queue = inner.queue.lock();
            queue.push(Queued { event, charged, permit });
            !std::mem::replace(&mut queue.running, true)
        };
        if start {
            LaneInner::schedule(inner)
        } else {
            Ok(())
        }
    }
}

/// Drains a lane once; releases the lane if it is dropped unrun.
struct DrainGuard {
    inner: Arc<LaneInner>,
    ran: bool,
}

impl DrainGuard {
    fn run(mut self) {
        self.inner.drain();
        self.ran = true;
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.ran {
            return;
        }
        let discarded = {
            let mut queue = self.inner.queue.lock();
            queue.running = false;
            let discarded = std::mem::take(&mut queue.events);
            if !discarded.is_empty() {
                queue.refused = true;
            }
            discarded
        };
        self.inner.idle.notify_all();
        if discarded.is_empty() {
            return;
        }

        tracing::warn!(
            connection = %self.inner.connection,
            events = discarded.len(),
            "Execution refused, dropping queued events"
        );
        let charged = discarded.iter().map(|queued| queued.charged).sum();
        drop(discarded);
        self.inner.release(charged);
        if let Some(mut state) = self.inner.attachment.lock().take() {
            state.abort(anyhow::anyhow!("queued events refused by the executor"));
        }
    }
}

/// An event over the pool limit, handed to the rejection policy.
struct RefusedEvent {
    inner: Arc<LaneInner>,
    queued: Option<Queued>,
}

impl RefusedEvent {
    fn run_on_caller(mut self) {
        if let Some(queued) = self.queued.take() {
            self.inner.run_on_caller(queued);
        }
    }
}

impl Drop for RefusedEvent {
    fn drop(&mut self) {
        if let Some(queued) = self.queued.take() {
            LaneInner::refused(&self.inner, queued);
        }
    }
}

impl LaneInner {
    fn schedule(inner: &Arc<LaneInner>) -> Result<(), ExecutionError> {
        let drain = DrainGuard {
            inner: Arc::clone(inner),
            ran: false,
        };
        match &inner.pool {
            // Queued events already carry their charge.
            Some(pool) => pool.execute(Task::new(0, move || drain.run())),
            None => {
                drain.run();
                Ok(())
            }
        }
    }

    /// Process `queued` on this thread, after whatever the lane already holds.
    fn run_on_caller(&self, queued: Queued) {
        let mut queue = self.queue.lock();
        queue.push(queued);
        while queue.running {
            self.idle.wait(&mut queue);
        }
        if queue.events.is_empty() {
            return;
        }
        queue.running = true;
        drop(queue);
        self.drain();
    }

    /// Fail the request `queued` belongs to, in order with its earlier events.
    fn refused(inner: &Arc<LaneInner>, queued: Queued) {
        let kind = queued.event.kind();
        drop(queued);
        tracing::warn!(
            connection = %inner.connection,
            event = kind,
            "Execution refused, failing the current request"
        );

        let cause = anyhow::anyhow!("{kind} event refused by the executor");
        let start = {
            let mut queue = inner.queue.lock();
            queue.refused = true;
            queue.events.push_back(Queued::uncharged(TransportEvent::Abort(cause)));
            !std::mem::replace(&mut queue.running, true)
        };
        if start {
            // A refused drain aborts the attachment itself.
            let _ = LaneInner::schedule(inner);
        }
    }

    fn release(&self, charged: usize) {
        if charged == 0 {
            return;
        }
        if let Some(pool) = &self.pool {
            pool.release(charged);
        }
    }

    fn drain(&self) {
        loop {
            let queued = {
                let mut queue = self.queue.lock();
                match queue.events.pop_front() {
                    Some(queued) => queued,
                    None => {
                        queue.running = false;
                        self.idle.notify_all();
                        return;
                    }
                }
            };
            let Queued { event, charged, permit } = queued;
            self.process(event);
            self.release(charged);
            drop(permit);
        }
    }

    fn process(&self, event: TransportEvent) {
        let kind = event.kind();
        let mut attachment = self.attachment.lock();
        match self.dispatcher.dispatch(&mut attachment, event) {
            Ok(()) | Err(InvocationError::Fault(_)) => {}
            Err(e) => {
                tracing::error!(
                    connection = %self.connection,
                    event = kind,
                    error = %e,
                    "Invalid event for the request state, closing connection"
                );
                self.closer.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::policy::{AbortPolicy, CallerRuns, DiscardPolicy, RejectionPolicy};
    use crate::http::consumer::BodyConsumer;
    use crate::http::hooks::HookChain;
    use crate::http::request::HttpRequest;
    use crate::http::responder::HttpResponder;
    use crate::http::testing::{head, info, RecordingResponder};
    use crate::routing::{Args, HandlerMethod, ResolvedRoute, StreamingFn};
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Appends each fragment to a shared string, slowly.
    struct Appender {
        text: Arc<Mutex<String>>,
        done: mpsc::Sender<String>,
    }

    impl BodyConsumer for Appender {
        fn chunk(
            &mut self,
            fragment: Bytes,
            _responder: &mut dyn HttpResponder,
        ) -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(2));
            self.text.lock().push_str(std::str::from_utf8(&fragment)?);
            Ok(())
        }

        fn finished(self: Box<Self>, responder: &mut dyn HttpResponder) -> anyhow::Result<()> {
            let text = self.text.lock().clone();
            responder.send_string(StatusCode::OK, &text);
            let _ = self.done.send(text);
            Ok(())
        }

        fn handle_error(self: Box<Self>, cause: &anyhow::Error) {
            let _ = self.done.send(format!("error: {cause}"));
        }
    }

    /// Counts bytes; the first fragment blocks until `gate` is released.
    struct Gated {
        received: usize,
        started: mpsc::Sender<()>,
        gate: Option<mpsc::Receiver<()>>,
        done: mpsc::Sender<String>,
    }

    impl BodyConsumer for Gated {
        fn chunk(
            &mut self,
            fragment: Bytes,
            _responder: &mut dyn HttpResponder,
        ) -> anyhow::Result<()> {
            if let Some(gate) = self.gate.take() {
                let _ = self.started.send(());
                let _ = gate.recv();
            }
            self.received += fragment.len();
            Ok(())
        }

        fn finished(self: Box<Self>, responder: &mut dyn HttpResponder) -> anyhow::Result<()> {
            responder.send_string(StatusCode::OK, &format!("Uploaded:{}", self.received));
            let _ = self.done.send(format!("Uploaded:{}", self.received));
            Ok(())
        }

        fn handle_error(self: Box<Self>, cause: &anyhow::Error) {
            let _ = self.done.send(format!("error: {cause}"));
        }
    }

    struct GatedParts {
        consumer: Box<dyn BodyConsumer>,
        gate: mpsc::Sender<()>,
        started: mpsc::Receiver<()>,
        done: mpsc::Receiver<String>,
    }

    fn gated() -> GatedParts {
        let (gate_tx, gate_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let consumer = Gated {
            received: 0,
            started: started_tx,
            gate: Some(gate_rx),
            done: done_tx,
        };
        GatedParts {
            consumer: Box::new(consumer),
            gate: gate_tx,
            started: started_rx,
            done: done_rx,
        }
    }

    fn streaming(consumer: Box<dyn BodyConsumer>) -> InvocationState {
        let slot = Mutex::new(Some(consumer));
        let method: Arc<StreamingFn> =
            Arc::new(move |_: &mut HttpRequest, _: &mut dyn HttpResponder, _: &Args| {
                slot.lock().take().ok_or_else(|| anyhow::anyhow!("consumer already taken"))
            });
        let route = ResolvedRoute {
            info: info(),
            handler: HandlerMethod::Streaming(method),
            args: Args::default(),
        };
        InvocationState::new(
            route,
            HttpRequest::chunked(head("/upload")),
            Box::new(RecordingResponder::default()),
            HookChain::default(),
        )
    }

    fn upload(done: mpsc::Sender<String>) -> InvocationState {
        streaming(Box::new(Appender {
            text: Arc::new(Mutex::new(String::new())),
            done,
        }))
    }

    fn chunk(len: usize) -> TransportEvent {
        TransportEvent::Chunk {
            data: Bytes::from(vec![b'x'; len]),
            last: false,
        }
    }

    fn last() -> TransportEvent {
        TransportEvent::Chunk {
            data: Bytes::new(),
            last: true,
        }
    }

    fn pooled(max_pending_bytes: usize, policy: Arc<dyn RejectionPolicy>) -> Arc<ExecutorPool> {
        Arc::new(ExecutorPool::new(4, Duration::from_secs(60), max_pending_bytes, policy))
    }

    fn lane_on(pool: &Arc<ExecutorPool>) -> ExecutionLane {
        ExecutionLane::new(Some(Arc::clone(pool)), ConnectionId::new(), ConnectionCloser::new())
    }

    fn queued_bytes(lane: &ExecutionLane) -> usize {
        let queue = lane.inner.queue.lock();
        queue.events.iter().map(|queued| queued.event.estimated_cost()).sum()
    }

    fn wait_for_idle(pool: &ExecutorPool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.pending_bytes() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.pending_bytes(), 0);
    }

    fn submit_body(lane: &ExecutionLane, done: mpsc::Sender<String>) {
        lane.submit(TransportEvent::Head(upload(done))).unwrap();
        for letter in ["a", "b", "c", "d", "e", "f"] {
            let data = Bytes::from_static(letter.as_bytes());
            lane.submit(TransportEvent::Chunk { data, last: false }).unwrap();
        }
        lane.submit(last()).unwrap();
    }

    #[test]
    fn pooled_lanes_keep_per_connection_order() {
        let pool = pooled(0, Arc::new(CallerRuns));
        let (tx, rx) = mpsc::channel();

        let lanes: Vec<_> = (0..3).map(|_| lane_on(&pool)).collect();
        for lane in &lanes {
            submit_body(lane, tx.clone());
        }

        for _ in 0..lanes.len() {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "abcdef");
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn inline_lane_dispatches_immediately() {
        let lane = ExecutionLane::new(None, ConnectionId::new(), ConnectionCloser::new());
        let (tx, rx) = mpsc::channel();
        submit_body(&lane, tx);
        assert_eq!(rx.try_recv().unwrap(), "abcdef");
    }

    #[test]
    fn stray_chunk_closes_the_connection() {
        let closer = ConnectionCloser::new();
        let lane = ExecutionLane::new(None, ConnectionId::new(), closer.clone());
        lane.submit(TransportEvent::Chunk { data: Bytes::from_static(b"x"), last: false })
            .unwrap();
        assert!(closer.is_closing());
    }

    #[test]
    fn refused_drain_releases_the_lane() {
        let pool = pooled(0, Arc::new(AbortPolicy));
        assert!(pool.shutdown(Duration::from_secs(1)));
        let lane = lane_on(&pool);

        let (tx, _rx) = mpsc::channel();
        let err = lane.submit(TransportEvent::Head(upload(tx))).unwrap_err();
        assert!(matches!(err, ExecutionError::Shutdown));
        assert!(!lane.inner.queue.lock().running);
        assert!(lane.inner.queue.lock().events.is_empty());
        assert_eq!(pool.pending_bytes(), 0);
    }

    #[test]
    fn queued_chunks_stay_within_the_pool_limit() {
        let limit = 4096;
        let pool = pooled(limit, Arc::new(CallerRuns));
        let lane = lane_on(&pool);
        let (tx, rx) = mpsc::channel();

        lane.submit(TransportEvent::Head(upload(tx))).unwrap();
        for _ in 0..50 {
            lane.submit(chunk(1024)).unwrap();
            assert!(queued_bytes(&lane) <= limit, "{} bytes queued", queued_bytes(&lane));
            assert!(pool.pending_bytes() <= limit);
        }
        lane.submit(last()).unwrap();

        let text = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(text.len(), 50 * 1024);
        wait_for_idle(&pool);
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn aborted_chunk_fails_the_request() {
        let pool = pooled(2048, Arc::new(AbortPolicy));
        let lane = lane_on(&pool);
        let GatedParts { consumer, gate, started, done } = gated();

        lane.submit(TransportEvent::Head(streaming(consumer))).unwrap();
        lane.submit(chunk(1024)).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        let err = lane.submit(chunk(1024)).unwrap_err();
        assert!(matches!(err, ExecutionError::Rejected { cost: 1088, .. }), "{err}");
        lane.submit(last()).unwrap();
        drop(gate);

        let outcome = done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.starts_with("error: "), "{outcome}");
        wait_for_idle(&pool);
        assert!(lane.inner.attachment.lock().is_none());
        assert!(done.try_recv().is_err());
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn discarded_chunk_never_completes_with_a_gap() {
        let pool = pooled(600, Arc::new(DiscardPolicy));
        let closer = ConnectionCloser::new();
        let lane = ExecutionLane::new(Some(Arc::clone(&pool)), ConnectionId::new(), closer.clone());
        let (tx, rx) = mpsc::channel();

        lane.submit(TransportEvent::Head(upload(tx))).unwrap();
        wait_for_idle(&pool);
        for len in [100, 1000, 100] {
            lane.submit(chunk(len)).unwrap();
            wait_for_idle(&pool);
        }
        lane.submit(last()).unwrap();
        wait_for_idle(&pool);

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.starts_with("error: chunk event refused"), "{outcome}");
        assert!(rx.try_recv().is_err());
        assert!(!closer.is_closing());

        // The next request on the connection is served normally.
        let (tx, rx) = mpsc::channel();
        lane.submit(TransportEvent::Head(upload(tx))).unwrap();
        wait_for_idle(&pool);
        lane.submit(chunk(100)).unwrap();
        lane.submit(last()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().len(), 100);
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn full_body_buffer_pauses_the_submitter() {
        let pool = Arc::new(ExecutorPool::new(2, Duration::from_secs(60), 0, Arc::new(CallerRuns)));
        let lane = ExecutionLane::with_buffer_limit(
            Some(Arc::clone(&pool)),
            ConnectionId::new(),
            ConnectionCloser::new(),
            4096,
        );
        let GatedParts { consumer, gate, started, done } = gated();

        lane.submit(TransportEvent::Head(streaming(consumer))).unwrap();
        lane.submit_throttled(chunk(1024)).await.unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        lane.submit_throttled(chunk(1024)).await.unwrap();
        lane.submit_throttled(chunk(1024)).await.unwrap();

        let blocked = lane.submit_throttled(chunk(1024));
        assert!(tokio::time::timeout(Duration::from_millis(200), blocked).await.is_err());

        drop(gate);
        tokio::time::timeout(Duration::from_secs(5), lane.submit_throttled(chunk(1024)))
            .await
            .unwrap()
            .unwrap();
        lane.submit_throttled(last()).await.unwrap();

        assert_eq!(done.recv_timeout(Duration::from_secs(5)).unwrap(), "Uploaded:4096");
        assert!(pool.shutdown(Duration::from_secs(5)));
    }
}
