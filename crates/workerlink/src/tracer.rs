//! Protocol tracing hooks.
//!
//! The engine notifies a [`Tracer`] on every send, response, forwarded event
//! and cancellation attempt. Tracers are purely observational.

use std::time::Duration;

/// Which path a cancellation took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPath {
    /// Removed from the queue before it was written.
    Dequeued,
    /// Already written; the worker was signalled out of band.
    Signalled,
    /// Already written and no out-of-band channel is configured.
    AlreadyDispatched,
    /// Nothing pending under that seq; the request had already resolved.
    AlreadyResolved,
}

pub trait Tracer: Send + Sync {
    fn on_send(&self, seq: u64, command: &str, expects_reply: bool, queue_len: usize);
    fn on_response(&self, seq: u64, command: &str, success: bool, elapsed: Option<Duration>);
    fn on_event(&self, event: &str);
    fn on_cancel(&self, seq: u64, path: CancelPath);
}

/// Tracer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn on_send(&self, _seq: u64, _command: &str, _expects_reply: bool, _queue_len: usize) {}
    fn on_response(&self, _seq: u64, _command: &str, _success: bool, _elapsed: Option<Duration>) {}
    fn on_event(&self, _event: &str) {}
    fn on_cancel(&self, _seq: u64, _path: CancelPath) {}
}

/// Tracer writing to the `workerlink::trace` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_send(&self, seq: u64, command: &str, expects_reply: bool, queue_len: usize) {
        tracing::trace!(
            target: "workerlink::trace",
            seq,
            command,
            expects_reply,
            queue_len,
            "Sending request"
        );
    }

    fn on_response(&self, seq: u64, command: &str, success: bool, elapsed: Option<Duration>) {
        match elapsed {
            Some(elapsed) => tracing::trace!(
                target: "workerlink::trace",
                seq,
                command,
                success,
                elapsed_ms = elapsed.as_millis() as u64,
                "Response received"
            ),
            None => tracing::trace!(
                target: "workerlink::trace",
                seq,
                command,
                success,
                "Response received for unknown request"
            ),
        }
    }

    fn on_event(&self, event: &str) {
        tracing::trace!(target: "workerlink::trace", event, "Event received");
    }

    fn on_cancel(&self, seq: u64, path: CancelPath) {
        match path {
            CancelPath::Dequeued => {
                tracing::trace!(target: "workerlink::trace", seq, "Cancelled request before it was sent")
            }
            CancelPath::Signalled => {
                tracing::trace!(target: "workerlink::trace", seq, "Signalled worker to cancel request")
            }
            CancelPath::AlreadyDispatched => tracing::trace!(
                target: "workerlink::trace",
                seq,
                "Tried to cancel request, but it was already delivered"
            ),
            CancelPath::AlreadyResolved => {
                tracing::trace!(target: "workerlink::trace", seq, "Nothing to cancel, request already resolved")
            }
        }
    }
}
