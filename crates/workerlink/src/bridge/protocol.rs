//! Wire protocol types for engine-worker communication.
//!
//! One channel in each direction:
//! - **Worker stdin**: [`Request`] records, one per command.
//! - **Worker stdout**: [`WorkerMessage`] records, either a response to a
//!   request or an unsolicited event.

use serde::{Deserialize, Serialize};

/// Event name the worker uses to signal that an asynchronous command has
/// finished, independent of the normal response channel.
pub const REQUEST_COMPLETED_EVENT: &str = "requestCompleted";

/// A command as written to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "request")]
pub struct Request {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub arguments: serde_json::Value,
}

/// Messages from worker to engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Sequence number of the request this answers.
    pub request_seq: u64,
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Error text when `success` is false.
    #[serde(default, alias = "error", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl Event {
    /// Sequence number carried by a completion event body (`{"request_seq": n}`).
    pub fn completed_seq(&self) -> Option<u64> {
        self.body
            .as_ref()?
            .get("request_seq")
            .and_then(serde_json::Value::as_u64)
    }
}
