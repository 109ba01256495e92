//! Caller-visible outcome of a submitted command.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
pub use tokio_util::sync::CancellationToken;

/// Whether a command is subject to the one-in-flight throttle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Serialized: only one synchronous command is in the pipe at a time.
    #[default]
    Sync,
    /// Exempt from the throttle; completion usually arrives as an event.
    Async,
}

impl CommandKind {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// A `success: false` response from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub command: String,
    /// Raw error text as sent by the worker (may be empty).
    pub text: String,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.text.is_empty() {
            write!(f, "{} failed", self.command)
        } else {
            write!(f, "{} failed: {}", self.command, self.text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("request cancelled")]
    Cancelled,
    #[error("failed to write request: {0}")]
    Write(String),
    #[error("worker responded with an error: {0}")]
    Worker(WorkerFailure),
    #[error("worker exited (code {code:?})")]
    WorkerExited { code: Option<i32> },
    #[error("worker error: {0}")]
    WorkerError(String),
    #[error("client disposed")]
    Disposed,
    #[error("engine stopped")]
    EngineStopped,
}

impl CommandError {
    /// Cancellation failures are requested by the caller and are not protocol errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type CommandResult = Result<serde_json::Value, CommandError>;

/// Future resolving to the result of one submitted command.
///
/// Resolves exactly once. Commands submitted without expecting a reply get an
/// outcome that is already resolved to `Ok(Value::Null)`.
#[must_use = "an outcome does nothing unless awaited"]
pub struct Outcome {
    inner: Inner,
}

enum Inner {
    Ready(Option<CommandResult>),
    Pending(oneshot::Receiver<CommandResult>),
}

impl Outcome {
    pub(crate) fn pending(rx: oneshot::Receiver<CommandResult>) -> Self {
        Self {
            inner: Inner::Pending(rx),
        }
    }

    pub fn ready(result: CommandResult) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    /// Outcome for a command that expects no reply.
    pub fn no_reply() -> Self {
        Self::ready(Ok(serde_json::Value::Null))
    }

    /// Non-blocking check; returns `None` while the command is still pending.
    ///
    /// The result is kept: checking again, or awaiting the outcome afterwards,
    /// yields the same result.
    pub fn try_result(&mut self) -> Option<CommandResult> {
        if let Inner::Pending(rx) = &mut self.inner {
            let result = match rx.try_recv() {
                Ok(result) => result,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Err(CommandError::EngineStopped),
            };
            self.inner = Inner::Ready(Some(result));
        }
        match &self.inner {
            Inner::Ready(result) => result.clone(),
            Inner::Pending(_) => None,
        }
    }
}

impl Future for Outcome {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(CommandError::EngineStopped)))
            }
            Inner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(CommandError::EngineStopped))),
        }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner {
            Inner::Ready(_) => "ready",
            Inner::Pending(_) => "pending",
        };
        f.debug_struct("Outcome").field("state", &state).finish()
    }
}
