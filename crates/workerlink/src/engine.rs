//! Protocol engine: queueing, flow control, response correlation and
//! cancellation for one worker.
//!
//! The engine is a plain state machine driven by its owner (the client event
//! loop). It owns the queue, the outcome registry, the synchronous in-flight
//! set and the writer half of the worker's stdin. Every operation that can
//! free capacity ends by draining the queue, so the pipeline drives itself.
//!
//! Flow control:
//! - At most one synchronous command that expects a reply is in flight.
//! - Nothing is written while that slot is occupied, whatever the queue holds.
//! - Asynchronous commands never occupy the slot and go out back-to-back.

use std::collections::{BTreeMap, HashSet};
use std::io;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::bridge::codec::MalformedFrame;
use crate::bridge::protocol::{Event, Request, Response, WorkerMessage};
use crate::config::EngineConfig;
use crate::diagnostics::{ErrorReport, MALFORMED_MESSAGE, WORKER_ERROR_RESPONSE};
use crate::outcome::{CancellationToken, CommandError, CommandKind, Outcome, WorkerFailure};
use crate::queue::CommandQueue;
use crate::registry::{OutcomeRegistry, PendingOutcome};
use crate::tracer::CancelPath;

/// Sink for requests bound for the worker's stdin.
///
/// Implementations must not wait on the worker reading its input: the engine
/// is driven by the same task that handles cancellation and disposal. Errors
/// that surface later are reported through [`Engine::on_write_failed`].
#[async_trait]
pub trait RequestWriter: Send {
    async fn write(&mut self, request: Request) -> io::Result<()>;
}

/// Notifications for subscribers of a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Worker event other than the completion event, forwarded unchanged.
    Event(Event),
    Exited { code: Option<i32> },
    Error { message: String },
}

/// How a command is submitted.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub kind: CommandKind,
    pub expects_reply: bool,
    pub cancellation: Option<CancellationToken>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self::sync()
    }
}

impl SubmitOptions {
    /// Synchronous command expecting a reply.
    pub fn sync() -> Self {
        Self {
            kind: CommandKind::Sync,
            expects_reply: true,
            cancellation: None,
        }
    }

    /// Asynchronous command expecting completion.
    pub fn asynchronous() -> Self {
        Self {
            kind: CommandKind::Async,
            ..Self::sync()
        }
    }

    /// Fire-and-forget command; its outcome resolves immediately.
    pub fn no_reply() -> Self {
        Self {
            expects_reply: false,
            ..Self::sync()
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// A command handed to the engine with its (optional) caller continuation.
#[derive(Debug)]
pub struct SubmitRequest {
    pub name: String,
    pub arguments: serde_json::Value,
    pub kind: CommandKind,
    pub pending: Option<PendingOutcome>,
}

impl SubmitRequest {
    /// Builds the request and the outcome the caller waits on.
    pub fn new(
        name: impl Into<String>,
        arguments: serde_json::Value,
        options: &SubmitOptions,
    ) -> (Self, Outcome) {
        let name = name.into();
        let (pending, outcome) = if options.expects_reply {
            let (pending, outcome) = PendingOutcome::new(name.clone(), options.kind);
            (Some(pending), outcome)
        } else {
            (None, Outcome::no_reply())
        };
        let request = Self {
            name,
            arguments,
            kind: options.kind,
            pending,
        };
        (request, outcome)
    }
}

pub struct Engine<W> {
    queue: CommandQueue,
    registry: OutcomeRegistry,
    in_flight: HashSet<u64>,
    writer: W,
    config: EngineConfig,
    events: broadcast::Sender<ClientEvent>,
    terminated: Option<CommandError>,
}

impl<W: RequestWriter> Engine<W> {
    pub fn new(writer: W, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self::with_events(writer, config, events)
    }

    /// Engine publishing to an existing event channel.
    pub fn with_events(
        writer: W,
        config: EngineConfig,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            queue: CommandQueue::new(),
            registry: OutcomeRegistry::new(),
            in_flight: HashSet::new(),
            writer,
            config,
            events,
            terminated: None,
        }
    }

    /// Submits a command and drains. Returns its sequence number (if it was
    /// accepted) and the caller's outcome.
    pub async fn submit(
        &mut self,
        name: impl Into<String>,
        arguments: serde_json::Value,
        options: SubmitOptions,
    ) -> (Option<u64>, Outcome) {
        let (request, outcome) = SubmitRequest::new(name, arguments, &options);
        let seq = self.enqueue(request);
        self.drain().await;
        (seq, outcome)
    }

    /// Queues a command and registers its outcome without draining.
    ///
    /// After teardown nothing is queued: the outcome fails right away with
    /// the teardown reason and `None` is returned.
    pub fn enqueue(&mut self, request: SubmitRequest) -> Option<u64> {
        let SubmitRequest {
            name,
            arguments,
            kind,
            pending,
        } = request;

        if let Some(reason) = &self.terminated {
            tracing::debug!(command = %name, %reason, "Rejecting command after teardown");
            if let Some(pending) = pending {
                pending.fail(reason.clone());
            }
            return None;
        }

        let expects_reply = pending.is_some();
        let command = self.queue.enqueue(name, arguments, expects_reply, kind);
        if let Some(pending) = pending {
            self.registry.register(command.seq(), pending);
        }
        tracing::debug!(
            seq = command.seq(),
            command = %command.name(),
            kind = kind.as_str(),
            expects_reply,
            "Queued command"
        );
        Some(command.seq())
    }

    /// Writes queued commands while no synchronous command is in flight.
    pub async fn drain(&mut self) {
        while self.in_flight.is_empty() {
            let Some(item) = self.queue.dequeue_next() else {
                break;
            };
            let seq = item.command.seq();
            self.config.tracer.on_send(
                seq,
                item.command.name(),
                item.expects_reply,
                self.queue.len(),
            );

            match self.writer.write(item.command.to_request()).await {
                Ok(()) => {
                    if item.gates_pipeline() {
                        self.in_flight.insert(seq);
                    }
                }
                Err(e) => self.fail_write(seq, e.to_string()),
            }
        }
    }

    /// A request already handed to the writer never reached the worker.
    /// Fails only that command, then re-arms the pipeline.
    pub async fn on_write_failed(&mut self, seq: u64, message: String) {
        self.fail_write(seq, message);
        self.in_flight.remove(&seq);
        self.drain().await;
    }

    fn fail_write(&mut self, seq: u64, message: String) {
        tracing::warn!(seq, error = %message, "Failed to write request");
        if let Some(pending) = self.registry.resolve_and_remove(seq) {
            pending.fail(CommandError::Write(message));
        }
    }

    /// Routes one decoded worker message, then re-arms the pipeline.
    pub async fn dispatch(&mut self, message: WorkerMessage) {
        let released = match message {
            WorkerMessage::Response(response) => Some(self.handle_response(response)),
            WorkerMessage::Event(event) => self.handle_event(event),
        };
        if let Some(seq) = released {
            self.in_flight.remove(&seq);
        }
        self.drain().await;
    }

    fn handle_response(&mut self, response: Response) -> u64 {
        let seq = response.request_seq;
        let Some(pending) = self.registry.resolve_and_remove(seq) else {
            self.config
                .tracer
                .on_response(seq, &response.command, response.success, None);
            tracing::debug!(seq, command = %response.command, "Discarding response with no pending outcome");
            return seq;
        };

        self.config.tracer.on_response(
            seq,
            pending.command(),
            response.success,
            Some(pending.elapsed()),
        );

        if response.success {
            pending.succeed(response.body.unwrap_or(serde_json::Value::Null));
        } else {
            let command = if response.command.is_empty() {
                pending.command().to_string()
            } else {
                response.command
            };
            let text = response.message.unwrap_or_default();
            self.report_failure(&command, &text);
            pending.fail(CommandError::Worker(WorkerFailure { command, text }));
        }
        seq
    }

    fn handle_event(&mut self, event: Event) -> Option<u64> {
        if event.event != self.config.completion_event {
            self.config.tracer.on_event(&event.event);
            // No subscribers is not an error.
            let _ = self.events.send(ClientEvent::Event(event));
            return None;
        }

        let Some(seq) = event.completed_seq() else {
            tracing::warn!(event = %event.event, "Completion event without request_seq");
            return None;
        };
        match self.registry.resolve_and_remove(seq) {
            Some(pending) => {
                self.config
                    .tracer
                    .on_response(seq, pending.command(), true, Some(pending.elapsed()));
                pending.succeed(serde_json::Value::Null);
            }
            None => {
                tracing::debug!(seq, "Completion event for request with no pending outcome");
            }
        }
        Some(seq)
    }

    /// Cancels a command: dequeues it if unsent, otherwise signals the worker
    /// out of band when possible. The caller's outcome fails with
    /// [`CommandError::Cancelled`] either way.
    pub async fn cancel(&mut self, seq: u64) {
        let queued = self.queue.cancel_if_queued(seq);
        if !queued && !self.registry.contains(seq) {
            tracing::debug!(seq, "Nothing to cancel, request already resolved");
            self.config.tracer.on_cancel(seq, CancelPath::AlreadyResolved);
            return;
        }

        let path = if queued {
            CancelPath::Dequeued
        } else if let Some(signaller) = &self.config.cancellation {
            if let Err(e) = signaller.signal(seq) {
                tracing::warn!(seq, error = %e, "Failed to signal cancellation to worker");
            }
            CancelPath::Signalled
        } else {
            tracing::info!(seq, "Request already dispatched to worker and cannot be cancelled");
            CancelPath::AlreadyDispatched
        };
        self.config.tracer.on_cancel(seq, path);

        if let Some(pending) = self.registry.resolve_and_remove(seq) {
            pending.fail(CommandError::Cancelled);
        }
        self.in_flight.remove(&seq);
        self.drain().await;
    }

    /// Reports a frame that could not be decoded. State is untouched.
    pub fn report_malformed(&self, frame: &MalformedFrame) {
        tracing::warn!(len = frame.len, reason = %frame.reason, "Discarding malformed worker message");
        let mut properties = BTreeMap::new();
        properties.insert("reason".to_string(), frame.reason.clone());
        properties.insert("len".to_string(), frame.len.to_string());
        self.config.diagnostics.record(MALFORMED_MESSAGE, properties);
    }

    fn report_failure(&self, command: &str, text: &str) {
        let report = ErrorReport::new(command, text);
        self.config
            .diagnostics
            .record(WORKER_ERROR_RESPONSE, report.into_properties());
    }

    /// Worker exited: notify subscribers, then fail everything outstanding.
    pub fn on_worker_exit(&mut self, code: Option<i32>) {
        tracing::warn!(?code, "Worker exited");
        let _ = self.events.send(ClientEvent::Exited { code });
        self.terminate(CommandError::WorkerExited { code });
    }

    /// Worker I/O failed: notify subscribers, then fail everything outstanding.
    pub fn on_worker_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(error = %message, "Worker error");
        let _ = self.events.send(ClientEvent::Error {
            message: message.clone(),
        });
        self.terminate(CommandError::WorkerError(message));
    }

    /// Shuts the engine down. Safe to call repeatedly and after worker exit.
    pub fn dispose(&mut self) {
        self.terminate(CommandError::Disposed);
    }

    fn terminate(&mut self, reason: CommandError) {
        let dropped = self.queue.clear();
        let failed = self.registry.force_fail_all(reason.clone());
        self.in_flight.clear();
        if dropped > 0 || failed > 0 {
            tracing::info!(dropped, failed, %reason, "Failed outstanding commands");
        }
        if self.terminated.is_none() {
            self.terminated = Some(reason);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = u64> + '_ {
        self.in_flight.iter().copied()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_len(&self) -> usize {
        self.registry.len()
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::cancellation::CancellationSignaller;
    use crate::diagnostics::{DiagnosticsSink, Properties};

    #[derive(Default)]
    struct RecordingWriter {
        sent: Vec<Request>,
        broken: bool,
        reject: Option<String>,
    }

    impl RecordingWriter {
        fn commands(&self) -> Vec<&str> {
            self.sent.iter().map(|r| r.command.as_str()).collect()
        }
    }

    #[async_trait]
    impl RequestWriter for RecordingWriter {
        async fn write(&mut self, request: Request) -> io::Result<()> {
            if self.broken || self.reject.as_deref() == Some(request.command.as_str()) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"));
            }
            self.sent.push(request);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDiagnostics(Mutex<Vec<(String, Properties)>>);

    impl DiagnosticsSink for RecordingDiagnostics {
        fn record(&self, event: &str, properties: Properties) {
            self.0.lock().unwrap().push((event.to_string(), properties));
        }
    }

    #[derive(Default)]
    struct RecordingSignaller(Mutex<Vec<u64>>);

    #[derive(Debug, Clone, PartialEq)]
    enum Traced {
        Send(u64, String, bool),
        Response(u64, String, bool, bool),
        Event(String),
        Cancel(u64, CancelPath),
    }

    /// Records every hook call; `Response` keeps only whether elapsed time was present.
    #[derive(Default)]
    struct RecordingTracer(Mutex<Vec<Traced>>);

    impl RecordingTracer {
        fn take(&self) -> Vec<Traced> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl crate::tracer::Tracer for RecordingTracer {
        fn on_send(&self, seq: u64, command: &str, expects_reply: bool, _queue_len: usize) {
            self.0
                .lock()
                .unwrap()
                .push(Traced::Send(seq, command.to_string(), expects_reply));
        }

        fn on_response(
            &self,
            seq: u64,
            command: &str,
            success: bool,
            elapsed: Option<std::time::Duration>,
        ) {
            self.0.lock().unwrap().push(Traced::Response(
                seq,
                command.to_string(),
                success,
                elapsed.is_some(),
            ));
        }

        fn on_event(&self, event: &str) {
            self.0.lock().unwrap().push(Traced::Event(event.to_string()));
        }

        fn on_cancel(&self, seq: u64, path: CancelPath) {
            self.0.lock().unwrap().push(Traced::Cancel(seq, path));
        }
    }

    impl CancellationSignaller for RecordingSignaller {
        fn signal(&self, seq: u64) -> io::Result<()> {
            self.0.lock().unwrap().push(seq);
            Ok(())
        }
    }

    fn engine() -> Engine<RecordingWriter> {
        Engine::new(RecordingWriter::default(), EngineConfig::new())
    }

    fn ok(seq: u64, body: serde_json::Value) -> WorkerMessage {
        WorkerMessage::Response(Response {
            request_seq: seq,
            success: true,
            command: String::new(),
            body: Some(body),
            message: None,
        })
    }

    fn err(seq: u64, command: &str, text: &str) -> WorkerMessage {
        WorkerMessage::Response(Response {
            request_seq: seq,
            success: false,
            command: command.to_string(),
            body: None,
            message: Some(text.to_string()),
        })
    }

    fn completed(seq: u64) -> WorkerMessage {
        WorkerMessage::Event(Event {
            event: "requestCompleted".to_string(),
            body: Some(json!({ "request_seq": seq })),
        })
    }

    #[tokio::test]
    async fn second_sync_command_waits_for_first() {
        let mut engine = engine();
        let (a, mut out_a) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        let (b, out_b) = engine.submit("b", json!(null), SubmitOptions::sync()).await;
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(engine.writer().commands(), ["a"]);
        assert_eq!(engine.in_flight().collect::<Vec<_>>(), [a]);
        assert_eq!(engine.queue_len(), 1);
        assert!(out_a.try_result().is_none());

        engine.dispatch(ok(a, json!("A"))).await;

        assert_eq!(engine.writer().commands(), ["a", "b"]);
        assert_eq!(engine.in_flight().collect::<Vec<_>>(), [b]);
        assert_eq!(out_a.await, Ok(json!("A")));

        engine.dispatch(ok(b, json!("B"))).await;
        assert_eq!(out_b.await, Ok(json!("B")));
        assert_eq!(engine.in_flight().count(), 0);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn async_commands_go_out_back_to_back() {
        let mut engine = engine();
        let (c, out_c) = engine.submit("c", json!(null), SubmitOptions::asynchronous()).await;
        let (d, out_d) = engine.submit("d", json!(null), SubmitOptions::asynchronous()).await;

        assert_eq!(engine.writer().commands(), ["c", "d"]);
        assert_eq!(engine.in_flight().count(), 0);
        assert_eq!(engine.pending_len(), 2);

        engine.dispatch(completed(d.unwrap())).await;
        engine.dispatch(completed(c.unwrap())).await;
        assert_eq!(out_c.await, Ok(json!(null)));
        assert_eq!(out_d.await, Ok(json!(null)));
    }

    #[tokio::test]
    async fn async_command_resolves_through_ordinary_response() {
        let mut engine = engine();
        let (seq, outcome) = engine.submit("geterr", json!(null), SubmitOptions::asynchronous()).await;
        let seq = seq.unwrap();

        engine.dispatch(ok(seq, json!({"diagnostics": []}))).await;
        assert_eq!(outcome.await, Ok(json!({"diagnostics": []})));

        // The completion event arriving afterwards finds nothing.
        engine.dispatch(completed(seq)).await;
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn async_command_is_not_blocked_by_in_flight_sync_only_by_queue_order() {
        let mut engine = engine();
        let (a, _out_a) = engine.submit("sync-a", json!(null), SubmitOptions::sync()).await;
        let _ = engine.submit("async-c", json!(null), SubmitOptions::asynchronous()).await;

        // FIFO: the async command sits behind the in-flight sync command.
        assert_eq!(engine.writer().commands(), ["sync-a"]);

        engine.dispatch(ok(a.unwrap(), json!(null))).await;
        assert_eq!(engine.writer().commands(), ["sync-a", "async-c"]);
    }

    #[tokio::test]
    async fn no_reply_commands_never_gate() {
        let mut engine = engine();
        let (_, outcome) = engine.submit("open", json!({"file": "a"}), SubmitOptions::no_reply()).await;
        let _ = engine.submit("change", json!(null), SubmitOptions::no_reply()).await;
        let _ = engine.submit("quickinfo", json!(null), SubmitOptions::sync()).await;

        assert_eq!(outcome.await, Ok(json!(null)));
        assert_eq!(engine.writer().commands(), ["open", "change", "quickinfo"]);
        assert_eq!(engine.pending_len(), 1);
    }

    #[tokio::test]
    async fn never_more_than_one_sync_in_flight() {
        let mut engine = engine();
        let mut seqs = Vec::new();
        for i in 0..10 {
            let options = if i % 2 == 0 {
                SubmitOptions::sync()
            } else {
                SubmitOptions::asynchronous()
            };
            let (seq, _outcome) = engine.submit(format!("cmd{i}"), json!(i), options).await;
            seqs.push(seq.unwrap());
            assert!(engine.in_flight().count() <= 1);
        }

        loop {
            let Some(seq) = engine.in_flight().next() else {
                break;
            };
            engine.dispatch(ok(seq, json!(null))).await;
            assert!(engine.in_flight().count() <= 1);
        }
        assert_eq!(engine.writer().sent.len(), 10);
        assert_eq!(engine.queue_len(), 0);
    }

    #[tokio::test]
    async fn cancelling_queued_command_means_it_is_never_written() {
        let mut engine = engine();
        let (a, _out_a) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        let (b, out_b) = engine.submit("b", json!(null), SubmitOptions::sync()).await;
        let _ = engine.submit("c", json!(null), SubmitOptions::sync()).await;

        engine.cancel(b.unwrap()).await;
        assert_eq!(out_b.await, Err(CommandError::Cancelled));

        engine.dispatch(ok(a.unwrap(), json!(null))).await;
        assert_eq!(engine.writer().commands(), ["a", "c"]);
    }

    #[tokio::test]
    async fn cancelling_sent_command_fails_caller_and_unblocks_queue() {
        let mut engine = engine();
        let (a, out_a) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        let (_, out_b) = engine.submit("b", json!(null), SubmitOptions::sync()).await;
        let a = a.unwrap();

        engine.cancel(a).await;

        assert_eq!(out_a.await, Err(CommandError::Cancelled));
        assert_eq!(engine.writer().commands(), ["a", "b"]);

        // The late answer for `a` is discarded and does not disturb `b`.
        engine.dispatch(ok(a, json!("late"))).await;
        let mut out_b = out_b;
        assert!(out_b.try_result().is_none());
        assert_eq!(engine.pending_len(), 1);
    }

    #[tokio::test]
    async fn cancelling_sent_command_signals_worker_when_configured() {
        let signaller = Arc::new(RecordingSignaller::default());
        let config = EngineConfig::new().with_cancellation(signaller.clone());
        let mut engine = Engine::new(RecordingWriter::default(), config);

        let (a, out_a) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        let (b, _out_b) = engine.submit("b", json!(null), SubmitOptions::sync()).await;

        engine.cancel(b.unwrap()).await;
        assert!(signaller.0.lock().unwrap().is_empty());

        engine.cancel(a.unwrap()).await;
        assert_eq!(*signaller.0.lock().unwrap(), [a.unwrap()]);
        assert_eq!(out_a.await, Err(CommandError::Cancelled));
    }

    #[tokio::test]
    async fn cancelling_resolved_command_is_a_no_op() {
        let signaller = Arc::new(RecordingSignaller::default());
        let config = EngineConfig::new().with_cancellation(signaller.clone());
        let mut engine = Engine::new(RecordingWriter::default(), config);

        let (a, out_a) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        engine.dispatch(ok(a.unwrap(), json!(1))).await;
        engine.cancel(a.unwrap()).await;

        assert_eq!(out_a.await, Ok(json!(1)));
        assert!(signaller.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_not_reported_to_diagnostics() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let config = EngineConfig::new().with_diagnostics(diagnostics.clone());
        let mut engine = Engine::new(RecordingWriter::default(), config);

        let (a, _out) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        engine.cancel(a.unwrap()).await;

        assert!(diagnostics.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_response_is_reported_with_parsed_message() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let config = EngineConfig::new().with_diagnostics(diagnostics.clone());
        let mut engine = Engine::new(RecordingWriter::default(), config);

        let (a, outcome) = engine.submit("rename", json!(null), SubmitOptions::sync()).await;
        engine
            .dispatch(err(
                a.unwrap(),
                "",
                "Error processing request. Bad arg\nat foo()",
            ))
            .await;

        assert_eq!(
            outcome.await,
            Err(CommandError::Worker(WorkerFailure {
                command: "rename".to_string(),
                text: "Error processing request. Bad arg\nat foo()".to_string(),
            }))
        );

        let records = diagnostics.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        let (event, properties) = &records[0];
        assert_eq!(event, WORKER_ERROR_RESPONSE);
        assert_eq!(properties["command"], "rename");
        assert_eq!(properties["message"], "Bad arg");
        assert_eq!(properties["stack"], "at foo()");
    }

    #[tokio::test]
    async fn unmatched_response_is_discarded() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let config = EngineConfig::new().with_diagnostics(diagnostics.clone());
        let mut engine = Engine::new(RecordingWriter::default(), config);

        engine.dispatch(ok(99, json!(null))).await;
        engine.dispatch(err(98, "x", "boom")).await;

        assert_eq!(engine.pending_len(), 0);
        assert!(diagnostics.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failure_fails_only_that_command() {
        let mut engine = Engine::new(
            RecordingWriter {
                reject: Some("bad".to_string()),
                ..Default::default()
            },
            EngineConfig::new(),
        );

        let (_, out_bad) = engine.submit("bad", json!(null), SubmitOptions::sync()).await;
        let (_, mut out_good) = engine.submit("good", json!(null), SubmitOptions::sync()).await;

        assert!(matches!(out_bad.await, Err(CommandError::Write(_))));
        assert_eq!(engine.writer().commands(), ["good"]);
        assert!(out_good.try_result().is_none());
        assert_eq!(engine.in_flight().count(), 1);
    }

    #[tokio::test]
    async fn broken_stdin_fails_each_command_independently() {
        let mut engine = Engine::new(
            RecordingWriter {
                broken: true,
                ..Default::default()
            },
            EngineConfig::new(),
        );

        let (_, first) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        let (_, second) = engine.submit("b", json!(null), SubmitOptions::asynchronous()).await;

        assert!(matches!(first.await, Err(CommandError::Write(_))));
        assert!(matches!(second.await, Err(CommandError::Write(_))));
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn other_events_are_forwarded() {
        let mut engine = engine();
        let mut events = engine.subscribe();
        let event = Event {
            event: "projectLoadingFinish".to_string(),
            body: Some(json!({"project": "p"})),
        };

        engine.dispatch(WorkerMessage::Event(event.clone())).await;

        assert_eq!(events.try_recv().unwrap(), ClientEvent::Event(event));
    }

    #[tokio::test]
    async fn completion_event_is_not_forwarded() {
        let mut engine = engine();
        let mut events = engine.subscribe();
        let (seq, outcome) = engine.submit("geterr", json!(null), SubmitOptions::asynchronous()).await;

        engine.dispatch(completed(seq.unwrap())).await;

        assert_eq!(outcome.await, Ok(json!(null)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn custom_completion_event_name() {
        let config = EngineConfig::new().with_completion_event("done");
        let mut engine = Engine::new(RecordingWriter::default(), config);
        let (seq, outcome) = engine.submit("work", json!(null), SubmitOptions::asynchronous()).await;

        engine
            .dispatch(WorkerMessage::Event(Event {
                event: "done".to_string(),
                body: Some(json!({"request_seq": seq.unwrap()})),
            }))
            .await;
        assert_eq!(outcome.await, Ok(json!(null)));
    }

    #[tokio::test]
    async fn worker_exit_fails_every_outstanding_outcome() {
        let mut engine = engine();
        let mut events = engine.subscribe();

        let (a, _) = engine.submit("sync-a", json!(null), SubmitOptions::sync()).await;
        let (_, out_c) = engine.submit("async-c", json!(null), SubmitOptions::asynchronous()).await;
        engine.dispatch(ok(a.unwrap(), json!(null))).await;
        let (_, out_b) = engine.submit("sync-b", json!(null), SubmitOptions::sync()).await;
        let (_, out_d) = engine.submit("sync-d", json!(null), SubmitOptions::sync()).await;
        let (_, out_e) = engine.submit("sync-e", json!(null), SubmitOptions::sync()).await;
        assert_eq!(engine.queue_len(), 2);

        engine.on_worker_exit(Some(1));

        let exited = CommandError::WorkerExited { code: Some(1) };
        for outcome in [out_c, out_b, out_d, out_e] {
            assert_eq!(outcome.await, Err(exited.clone()));
        }
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.in_flight().count(), 0);
        assert_eq!(events.try_recv().unwrap(), ClientEvent::Exited { code: Some(1) });
    }

    #[tokio::test]
    async fn worker_error_notifies_then_fails() {
        let mut engine = engine();
        let mut events = engine.subscribe();
        let (_, outcome) = engine.submit("a", json!(null), SubmitOptions::sync()).await;

        engine.on_worker_error("frame too large");

        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::Error {
                message: "frame too large".to_string()
            }
        );
        assert_eq!(
            outcome.await,
            Err(CommandError::WorkerError("frame too large".to_string()))
        );
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_rejects_later_commands() {
        let mut engine = engine();
        let (_, outcome) = engine.submit("a", json!(null), SubmitOptions::sync()).await;

        engine.dispose();
        engine.dispose();
        assert_eq!(outcome.await, Err(CommandError::Disposed));
        assert_eq!(engine.pending_len(), 0);

        let (seq, late) = engine.submit("b", json!(null), SubmitOptions::sync()).await;
        assert!(seq.is_none());
        assert_eq!(late.await, Err(CommandError::Disposed));
        assert_eq!(engine.writer().commands(), ["a"]);
    }

    #[tokio::test]
    async fn dispose_after_exit_keeps_exit_reason() {
        let mut engine = engine();
        engine.on_worker_exit(None);
        engine.dispose();

        let (_, late) = engine.submit("b", json!(null), SubmitOptions::sync()).await;
        assert_eq!(late.await, Err(CommandError::WorkerExited { code: None }));
    }

    #[tokio::test]
    async fn malformed_frames_are_reported() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let config = EngineConfig::new().with_diagnostics(diagnostics.clone());
        let engine = Engine::new(RecordingWriter::default(), config);

        engine.report_malformed(&MalformedFrame {
            len: 5,
            reason: "expected value".to_string(),
        });

        let records = diagnostics.0.lock().unwrap();
        assert_eq!(records[0].0, MALFORMED_MESSAGE);
        assert_eq!(records[0].1["len"], "5");
    }

    #[tokio::test]
    async fn tracer_sees_sends_responses_and_events() {
        let tracer = Arc::new(RecordingTracer::default());
        let config = EngineConfig::new().with_tracer(tracer.clone());
        let mut engine = Engine::new(RecordingWriter::default(), config);

        let (a, _out_a) = engine.submit("quickinfo", json!(null), SubmitOptions::sync()).await;
        let (b, _) = engine.submit("open", json!(null), SubmitOptions::no_reply()).await;
        let a = a.unwrap();
        engine.dispatch(ok(a, json!(null))).await;
        engine.dispatch(ok(77, json!(null))).await;
        engine
            .dispatch(WorkerMessage::Event(Event {
                event: "telemetry".to_string(),
                body: None,
            }))
            .await;

        assert_eq!(
            tracer.take(),
            [
                Traced::Send(a, "quickinfo".to_string(), true),
                Traced::Response(a, "quickinfo".to_string(), true, true),
                Traced::Send(b.unwrap(), "open".to_string(), false),
                Traced::Response(77, String::new(), true, false),
                Traced::Event("telemetry".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn tracer_sees_every_cancellation_path() {
        let tracer = Arc::new(RecordingTracer::default());
        let signaller = Arc::new(RecordingSignaller::default());
        let config = EngineConfig::new().with_tracer(tracer.clone());
        let mut plain = Engine::new(RecordingWriter::default(), config.clone());
        let mut signalling = Engine::new(
            RecordingWriter::default(),
            config.with_cancellation(signaller.clone()),
        );

        let (a, _) = plain.submit("a", json!(null), SubmitOptions::sync()).await;
        let (b, _) = plain.submit("b", json!(null), SubmitOptions::sync()).await;
        let (a, b) = (a.unwrap(), b.unwrap());
        plain.cancel(b).await;
        plain.cancel(a).await;
        plain.cancel(a).await;

        let (c, _) = signalling.submit("c", json!(null), SubmitOptions::sync()).await;
        let c = c.unwrap();
        signalling.cancel(c).await;

        let cancels: Vec<_> = tracer
            .take()
            .into_iter()
            .filter(|t| matches!(t, Traced::Cancel(..)))
            .collect();
        assert_eq!(
            cancels,
            [
                Traced::Cancel(b, CancelPath::Dequeued),
                Traced::Cancel(a, CancelPath::AlreadyDispatched),
                Traced::Cancel(a, CancelPath::AlreadyResolved),
                Traced::Cancel(c, CancelPath::Signalled),
            ]
        );
        assert_eq!(*signaller.0.lock().unwrap(), [c]);
    }

    #[tokio::test]
    async fn late_write_failure_fails_command_and_unblocks_queue() {
        let mut engine = engine();
        let (a, out_a) = engine.submit("a", json!(null), SubmitOptions::sync()).await;
        let (b, mut out_b) = engine.submit("b", json!(null), SubmitOptions::sync()).await;
        let a = a.unwrap();

        engine.on_write_failed(a, "broken pipe".to_string()).await;

        assert_eq!(out_a.await, Err(CommandError::Write("broken pipe".to_string())));
        assert_eq!(engine.writer().commands(), ["a", "b"]);
        assert_eq!(engine.in_flight().collect::<Vec<_>>(), [b.unwrap()]);
        assert!(out_b.try_result().is_none());
    }
}
