//! Diagnostics reporting for worker-side failures.
//!
//! Failed responses are turned into an [`ErrorReport`] and handed to a
//! [`DiagnosticsSink`]. Recording is fire-and-forget: a sink can never
//! influence protocol state.

use std::collections::BTreeMap;

/// Event name for `success: false` responses.
pub const WORKER_ERROR_RESPONSE: &str = "worker_error_response";
/// Event name for frames that could not be decoded.
pub const MALFORMED_MESSAGE: &str = "malformed_message";

/// Prefix the worker puts in front of unexpected internal errors.
const ERROR_PREFIX: &str = "Error processing request. ";

pub type Properties = BTreeMap<String, String>;

/// Collaborator receiving diagnostic records.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: &str, properties: Properties);
}

/// Default sink: emits each record as a structured `tracing` warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn record(&self, event: &str, properties: Properties) {
        tracing::warn!(target: "workerlink::diagnostics", event, ?properties, "Diagnostic recorded");
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl DiagnosticsSink for NoopDiagnostics {
    fn record(&self, _event: &str, _properties: Properties) {}
}

/// Diagnostic view of a failed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub command: String,
    pub error_text: String,
    pub message: Option<String>,
    pub stack: Option<String>,
}

impl ErrorReport {
    /// Builds a report, splitting `"Error processing request. <message>\n<stack>"`
    /// into its message and stack when the text has that shape.
    pub fn new(command: impl Into<String>, error_text: impl Into<String>) -> Self {
        let error_text = error_text.into();
        let (message, stack) = match parse_error_text(&error_text) {
            Some((message, stack)) => (Some(message.to_string()), Some(stack.to_string())),
            None => (None, None),
        };
        Self {
            command: command.into(),
            error_text,
            message,
            stack,
        }
    }

    pub fn into_properties(self) -> Properties {
        let mut properties = Properties::new();
        properties.insert("command".to_string(), self.command);
        properties.insert("error_text".to_string(), self.error_text);
        if let Some(message) = self.message {
            properties.insert("message".to_string(), message);
        }
        if let Some(stack) = self.stack {
            properties.insert("stack".to_string(), stack);
        }
        properties
    }
}

fn parse_error_text(text: &str) -> Option<(&str, &str)> {
    text.strip_prefix(ERROR_PREFIX)?.split_once('\n')
}
