//! Engine configuration.

use std::sync::Arc;

use crate::bridge::protocol::REQUEST_COMPLETED_EVENT;
use crate::cancellation::{CancellationSignaller, FileCancellation};
use crate::diagnostics::{DiagnosticsSink, TracingDiagnostics};
use crate::tracer::{LogTracer, NoopTracer, Tracer};

/// Default buffer of the client event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EngineConfig {
    pub completion_event: String,
    pub cancellation: Option<Arc<dyn CancellationSignaller>>,
    pub tracer: Arc<dyn Tracer>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion_event: REQUEST_COMPLETED_EVENT.to_string(),
            cancellation: None,
            tracer: Arc::new(NoopTracer),
            diagnostics: Arc::new(TracingDiagnostics),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults plus environment overrides:
    /// - `WORKERLINK_CANCELLATION_PREFIX`: enables file-based cancellation.
    /// - `WORKERLINK_TRACE=1`: enables the log tracer.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("WORKERLINK_CANCELLATION_PREFIX")
            && !prefix.is_empty()
        {
            config = config.with_cancellation(Arc::new(FileCancellation::new(prefix)));
        }

        if std::env::var("WORKERLINK_TRACE").as_deref() == Ok("1") {
            config = config.with_tracer(Arc::new(LogTracer));
        }

        config
    }

    pub fn with_completion_event(mut self, event: impl Into<String>) -> Self {
        self.completion_event = event.into();
        self
    }

    pub fn with_cancellation(mut self, cancellation: Arc<dyn CancellationSignaller>) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("completion_event", &self.completion_event)
            .field("cancellation", &self.cancellation.is_some())
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}
